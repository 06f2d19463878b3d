//! TTFT / TPOT accounting.

/// Latency figures recorded on every request log row.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Latency {
    pub latency_ms: i64,
    pub ttft_ms: Option<i64>,
    pub tpot_ms: Option<f64>,
}

/// Derive the per-request latency record.
///
/// `ttft_ms` is the elapsed time at the first emitted token; callers pass
/// `None` for non-streaming requests or when no token was ever observed.
/// TPOT averages over the post-first-token window when streaming, the whole
/// call otherwise, and is undefined without positive output.
pub fn compute(
    latency_ms: i64,
    ttft_ms: Option<i64>,
    output_tokens: Option<u64>,
    streaming: bool,
) -> Latency {
    let ttft_ms = if streaming { ttft_ms } else { None };

    let tpot_ms = match output_tokens {
        Some(output) if output > 0 => {
            let window = if streaming {
                match ttft_ms {
                    Some(ttft) => Some((latency_ms - ttft).max(0)),
                    None => None,
                }
            } else {
                Some(latency_ms)
            };
            window.map(|window| round2(window as f64 / output as f64))
        }
        _ => None,
    };

    Latency {
        latency_ms,
        ttft_ms,
        tpot_ms,
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
