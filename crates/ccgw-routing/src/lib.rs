//! Model routing: map an inbound request to a concrete (provider, model)
//! target using an endpoint's route table, defaults, and the global
//! fallback flag.

use ccgw_config::{GatewayConfig, RoutingDefaults};
use serde::Serialize;

mod pattern;

pub use pattern::RoutePattern;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("no providers are configured")]
    NoProviders,
    #[error("no route matched and no default resolved")]
    NoMatch,
}

#[derive(Debug, Clone, Copy)]
pub struct RouteQuery<'a> {
    pub endpoint: &'a str,
    pub requested_model: Option<&'a str>,
    /// Caller asked for extended reasoning.
    pub thinking: bool,
    /// Estimated input tokens, computed once per request.
    pub token_estimate: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteDecision {
    pub provider_id: String,
    pub model_id: String,
    pub token_estimate: u64,
}

/// Resolve a route per the fixed precedence: explicit `provider:model`
/// override, then the endpoint route table, then defaults
/// (reasoning / background / completion), then the global fallback.
pub fn resolve_route(
    config: &GatewayConfig,
    query: RouteQuery<'_>,
) -> Result<RouteDecision, RouteError> {
    if config.providers.is_empty() {
        return Err(RouteError::NoProviders);
    }

    // Explicit provider:model bypasses routes and defaults entirely.
    if let Some(requested) = query.requested_model
        && let Some((provider_id, model_id)) = split_explicit_target(requested)
        && config.provider(provider_id).is_some()
    {
        return Ok(decision(provider_id, model_id, query.token_estimate));
    }

    let routing = config.routing_for(query.endpoint);

    if let Some(requested) = query.requested_model
        && let Some(routing) = routing
        && let Some(target) = best_route_target(&routing.model_routes, requested)
    {
        let (provider_id, model_part) = split_target(target);
        if config.provider(provider_id).is_some() {
            let model_id = match model_part {
                // `*` forwards the caller's model id unchanged.
                Some("*") | None => requested,
                Some(model) => model,
            };
            return Ok(decision(provider_id, model_id, query.token_estimate));
        }
        // Mapped provider no longer exists: fall through to defaults.
    }

    let defaults = routing.map(|routing| &routing.defaults);
    if let Some(target) = select_default(defaults, &query)
        && let Some((provider_id, model_id)) = split_explicit_target(target)
        && config.provider(provider_id).is_some()
    {
        return Ok(decision(provider_id, model_id, query.token_estimate));
    }

    if config.enable_routing_fallback
        && let Some(first) = config.providers.first()
    {
        let model_id = first
            .default_model
            .as_deref()
            .or_else(|| first.models.first().map(|model| model.id.as_str()))
            .or(query.requested_model);
        if let Some(model_id) = model_id {
            return Ok(decision(&first.id, model_id, query.token_estimate));
        }
    }

    Err(RouteError::NoMatch)
}

fn decision(provider_id: &str, model_id: &str, token_estimate: u64) -> RouteDecision {
    RouteDecision {
        provider_id: provider_id.to_string(),
        model_id: model_id.to_string(),
        token_estimate,
    }
}

/// `provider:model` with both sides non-empty and exactly one colon.
fn split_explicit_target(input: &str) -> Option<(&str, &str)> {
    let (left, right) = input.split_once(':')?;
    if left.is_empty() || right.is_empty() || right.contains(':') {
        return None;
    }
    Some((left, right))
}

/// Route value: `provider`, `provider:model`, or `provider:*`.
fn split_target(target: &str) -> (&str, Option<&str>) {
    match target.split_once(':') {
        Some((provider, model)) if !model.is_empty() => (provider, Some(model)),
        Some((provider, _)) => (provider, None),
        None => (target, None),
    }
}

/// Evaluate all route keys against the requested model and keep the most
/// specific match (compiled-pattern total order, see [`RoutePattern`]).
fn best_route_target<'a>(
    routes: &'a std::collections::BTreeMap<String, String>,
    requested: &str,
) -> Option<&'a str> {
    routes
        .iter()
        .filter_map(|(key, target)| {
            let pattern = RoutePattern::compile(key);
            pattern.matches(requested).then_some((pattern, target))
        })
        .min_by(|(a, _), (b, _)| a.cmp(b))
        .map(|(_, target)| target.as_str())
}

fn select_default<'a>(
    defaults: Option<&'a RoutingDefaults>,
    query: &RouteQuery<'_>,
) -> Option<&'a str> {
    let defaults = defaults?;
    if query.thinking {
        return defaults.reasoning.as_deref();
    }
    if let Some(threshold) = defaults.long_context_threshold
        && query.token_estimate > threshold
    {
        return defaults.background.as_deref();
    }
    defaults.completion.as_deref()
}
