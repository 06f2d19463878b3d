pub mod management;
pub mod public;

mod http;

pub use management::management_router;
pub use public::public_router;
