//! Registration-time model verification.
//!
//! A candidate backend must prove it runs an approved model before it can
//! join the pool: it is sent a fixed completion probe with a pinned seed,
//! and the returned model identifier plus top-10 token-probability vector
//! are checked against an allow-list and reference fingerprints. The gate
//! runs once, at registration, never per-request.

use serde::Deserialize;
use serde_json::json;

use slipstream_core::{Error, Result};

/// Model identifiers allowed to join the pool.
pub const ALLOWED_MODELS: &[&str] = &["sakura-14b-qwen2beta-v0.9.2-iq4xs"];

/// Maximum squared Euclidean distance to a reference fingerprint.
pub const FINGERPRINT_DISTANCE_THRESHOLD: f64 = 0.001;

/// Prompt sent with the fingerprint probe.
///
/// The probe pins every sampling knob (`seed = 0`, single token, ten
/// probabilities), so an approved model answers with a probability vector
/// close to one of [`REFERENCE_FINGERPRINTS`].
pub const PROBE_PROMPT: &str = "<|im_start|>system\n你是一个轻小说翻译模型，可以流畅通顺地以日本轻小说的风格将日文翻译成简体中文，并联系上下文正确使用人称代词，不擅自添加原文中没有的代词。<|im_end|>\n<|im_start|>user\n将下面的日文文本翻译成中文：国境の長いトンネルを抜けると雪国であった<|im_end|>\n<|im_start|>assistant\n";

/// Reference top-10 probability vectors for the approved model builds.
pub const REFERENCE_FINGERPRINTS: [[f64; 10]; 3] = [
    [
        0.5601178407669067,
        0.10090667009353638,
        0.07124997675418854,
        0.050760358572006226,
        0.048443447798490524,
        0.04311312735080719,
        0.034672778099775314,
        0.03223879635334015,
        0.03134223446249962,
        0.027154725044965744,
    ],
    [
        0.5544909238815308,
        0.09134039282798767,
        0.0702454224228859,
        0.055606868118047714,
        0.05284511670470238,
        0.04588409513235092,
        0.039813119918107986,
        0.0325898602604866,
        0.030937371775507927,
        0.026246793568134308,
    ],
    [
        0.5889551043510437,
        0.08219610154628754,
        0.06368642300367355,
        0.05597573518753052,
        0.04624505341053009,
        0.044758766889572144,
        0.03576425090432167,
        0.030524807050824165,
        0.029894692823290825,
        0.021998988464474678,
    ],
];

/// JSON body for the fingerprint probe request.
pub fn probe_request_body() -> serde_json::Value {
    json!({
        "prompt": PROBE_PROMPT,
        "temperature": 1,
        "top_p": 1,
        "n_predict": 1,
        "n_probs": 10,
        "min_keep": 10,
        "seed": 0,
    })
}

#[derive(Deserialize)]
struct ProbeCompletion {
    model: String,
    completion_probabilities: Vec<TokenProbabilities>,
}

#[derive(Deserialize)]
struct TokenProbabilities {
    probs: Vec<TokenProbability>,
}

#[derive(Deserialize)]
struct TokenProbability {
    prob: f64,
}

/// Checks a completion-probe response body against the allow-list.
///
/// `Ok(false)` means the backend answered coherently but is not an
/// approved model; malformed bodies are a [`Error::ProbeParse`] error.
pub fn verify_completion_body(body: &[u8]) -> Result<bool> {
    let completion: ProbeCompletion =
        serde_json::from_slice(body).map_err(Error::probe_parse)?;

    let first = completion
        .completion_probabilities
        .first()
        .ok_or_else(|| Error::probe_parse("empty completion_probabilities"))?;
    let probs: Vec<f64> = first.probs.iter().map(|token| token.prob).collect();

    Ok(model_allowed(&completion.model) && fingerprint_matches(&probs))
}

/// Whether this model identifier is allow-listed.
pub fn model_allowed(model: &str) -> bool {
    ALLOWED_MODELS.contains(&model)
}

/// Whether a probability vector matches any reference fingerprint.
pub fn fingerprint_matches(probs: &[f64]) -> bool {
    REFERENCE_FINGERPRINTS
        .iter()
        .any(|reference| squared_distance(probs, reference) < FINGERPRINT_DISTANCE_THRESHOLD)
}

/// Squared Euclidean distance, treating missing reference entries as zero.
fn squared_distance(probs: &[f64], reference: &[f64; 10]) -> f64 {
    probs
        .iter()
        .enumerate()
        .map(|(i, prob)| {
            let expected = reference.get(i).copied().unwrap_or(0.0);
            (prob - expected).powi(2)
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe_body(model: &str, probs: &[f64]) -> Vec<u8> {
        let tokens: Vec<serde_json::Value> =
            probs.iter().map(|p| json!({ "prob": p })).collect();
        serde_json::to_vec(&json!({
            "model": model,
            "completion_probabilities": [{ "probs": tokens }],
        }))
        .unwrap()
    }

    #[test]
    fn exact_fingerprint_is_accepted() {
        let body = probe_body(ALLOWED_MODELS[0], &REFERENCE_FINGERPRINTS[1]);
        assert!(verify_completion_body(&body).unwrap());
    }

    #[test]
    fn near_fingerprint_within_threshold_is_accepted() {
        let mut probs = REFERENCE_FINGERPRINTS[0].to_vec();
        probs[0] += 0.01; // squared distance 1e-4, under the threshold
        let body = probe_body(ALLOWED_MODELS[0], &probs);
        assert!(verify_completion_body(&body).unwrap());
    }

    #[test]
    fn distant_fingerprint_is_rejected() {
        let probs = [0.1; 10];
        let body = probe_body(ALLOWED_MODELS[0], &probs);
        assert!(!verify_completion_body(&body).unwrap());
    }

    #[test]
    fn unknown_model_is_rejected_despite_fingerprint() {
        let body = probe_body("some-other-model", &REFERENCE_FINGERPRINTS[0]);
        assert!(!verify_completion_body(&body).unwrap());
    }

    #[test]
    fn malformed_probe_body_is_a_parse_error() {
        assert!(matches!(
            verify_completion_body(b"{}"),
            Err(Error::ProbeParse { .. })
        ));
        assert!(matches!(
            verify_completion_body(br#"{"model":"m","completion_probabilities":[]}"#),
            Err(Error::ProbeParse { .. })
        ));
    }

    #[test]
    fn probe_request_is_deterministic() {
        let body = probe_request_body();
        assert_eq!(body["seed"], 0);
        assert_eq!(body["n_predict"], 1);
        assert_eq!(body["n_probs"], 10);
        assert_eq!(probe_request_body(), body);
    }
}
