// SPDX-License-Identifier: MIT OR Apache-2.0

//! Structural tensor-key classification.
//!
//! Checkpoint keys are dotted paths such as
//! `layers.12.attention.q_proj.weight`. The classifier maps each key to
//! the layer index embedded in it, or to a named non-indexed component
//! (embedders, refiners, the final output head), using an ordered list
//! of matchers. Exclusion rules (normalization markers, bias markers)
//! live here as an explicit token vocabulary rather than ad hoc
//! substring checks scattered through the engine.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;

// ---------------------------------------------------------------------------
// Matchers
// ---------------------------------------------------------------------------

/// One strategy for extracting a layer index from a key.
///
/// Matchers are tried in priority order; the first capturing match wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Matcher {
    /// Path-segment positional extraction: split on `.`, find the named
    /// container segment, parse the immediately following segment as the
    /// index. Handles both `layers.7.…` and `model.layers.7.…`.
    Segment(&'static str),
    /// Pattern capture: search for a numeric group following a known
    /// stack-name token (`.layers.N.` or `.h.N.`), covering the two
    /// historical container-naming conventions that coexist in the same
    /// checkpoint family.
    StackCapture,
}

impl Matcher {
    /// Apply this matcher to a key.
    #[must_use]
    pub fn extract(self, key: &str) -> Option<usize> {
        match self {
            Self::Segment(container) => {
                let mut segments = key.split('.');
                segments
                    .by_ref()
                    .find(|segment| *segment == container)
                    .and_then(|_| segments.next())
                    .and_then(|index| index.parse().ok())
            }
            Self::StackCapture => {
                static RE: OnceLock<Regex> = OnceLock::new();
                let re = RE.get_or_init(|| {
                    Regex::new(r"(?:^|\.)(?:layers|h)\.(\d+)\.")
                        .expect("internal built-in regex must compile")
                });
                re.captures(key)
                    .and_then(|caps| caps.get(1))
                    .and_then(|m| m.as_str().parse().ok())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// KeyClass
// ---------------------------------------------------------------------------

/// Non-indexed components governed by dedicated scale inputs.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentKind {
    /// Input embedders (token, timestep, caption).
    Embedder,
    /// Noise refiner blocks.
    NoiseRefiner,
    /// Context refiner blocks.
    ContextRefiner,
    /// Generic refiner blocks (when noise/context are not distinguished).
    Refiner,
    /// Final output head. Architecturally adjacent to the last
    /// transformer block, so it inherits the last layer-group's scale.
    FinalLayer,
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Embedder => write!(f, "embedder"),
            Self::NoiseRefiner => write!(f, "noise-refiner"),
            Self::ContextRefiner => write!(f, "context-refiner"),
            Self::Refiner => write!(f, "refiner"),
            Self::FinalLayer => write!(f, "final-layer"),
        }
    }
}

/// Classification of a tensor key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyClass {
    /// Part of the indexed layer stack.
    Layer(usize),
    /// A non-indexed component with its own scale input.
    Component(ComponentKind),
    /// Outside the governed structure (ignored by the engine).
    Other,
}

// ---------------------------------------------------------------------------
// KeyClassifier
// ---------------------------------------------------------------------------

/// Token vocabulary plus matcher order for one target architecture.
#[derive(Debug, Clone)]
pub struct KeyClassifier {
    /// Index matchers in priority order.
    matchers: Vec<Matcher>,
    /// Segment tokens marking normalization parameters.
    norm_tokens: Vec<&'static str>,
    /// Component tokens in priority order (more specific first).
    components: Vec<(&'static str, ComponentKind)>,
    /// Whether bias parameters are excluded from index-based scaling.
    exclude_bias: bool,
}

impl KeyClassifier {
    /// Classifier for diffusion backbones.
    ///
    /// Biases are governed together with weights; normalization layers
    /// (including `adaLN` modulation) are locked unless the caller opts
    /// in, because naive scaling of normalization parameters reliably
    /// produces visible artifacts.
    #[must_use]
    pub fn diffusion() -> Self {
        Self {
            matchers: vec![
                Matcher::Segment("layers"),
                Matcher::Segment("joint_blocks"),
                Matcher::Segment("blocks"),
            ],
            norm_tokens: vec!["norm", "adaLN"],
            components: vec![
                ("noise_refiner", ComponentKind::NoiseRefiner),
                ("context_refiner", ComponentKind::ContextRefiner),
                ("refiner", ComponentKind::Refiner),
                ("embedder", ComponentKind::Embedder),
                ("final_layer", ComponentKind::FinalLayer),
            ],
            exclude_bias: false,
        }
    }

    /// Classifier for text encoders.
    ///
    /// Both normalization and bias parameters are excluded outright:
    /// modifying either in an LLM leads to immediate token collapse.
    #[must_use]
    pub fn text_encoder() -> Self {
        Self {
            matchers: vec![Matcher::StackCapture, Matcher::Segment("layers")],
            norm_tokens: vec!["norm"],
            components: Vec::new(),
            exclude_bias: true,
        }
    }

    /// Resolve the layer index embedded in `key`, trying matchers in
    /// priority order.
    #[must_use]
    pub fn resolve(&self, key: &str) -> Option<usize> {
        self.matchers.iter().find_map(|m| m.extract(key))
    }

    /// Classify a key as indexed layer, named component, or other.
    #[must_use]
    pub fn classify(&self, key: &str) -> KeyClass {
        if let Some(index) = self.resolve(key) {
            return KeyClass::Layer(index);
        }
        for (token, kind) in &self.components {
            if segment_contains(key, token) {
                return KeyClass::Component(*kind);
            }
        }
        KeyClass::Other
    }

    /// Whether `key` names a parameter tensor (ends in `weight` or `bias`).
    #[must_use]
    pub fn is_param(&self, key: &str) -> bool {
        matches!(key.rsplit('.').next(), Some("weight" | "bias"))
    }

    /// Whether `key` carries a normalization marker.
    #[must_use]
    pub fn is_norm(&self, key: &str) -> bool {
        self.norm_tokens.iter().any(|t| segment_contains(key, t))
    }

    /// Whether `key` names a bias parameter.
    #[must_use]
    pub fn is_bias(&self, key: &str) -> bool {
        matches!(key.rsplit('.').next(), Some("bias"))
    }

    /// Whether `key` is excluded from scaling.
    ///
    /// `tune_normalization` is the explicit user opt-in required before
    /// normalization layers may be scaled at all.
    #[must_use]
    pub fn is_excluded(&self, key: &str, tune_normalization: bool) -> bool {
        if self.is_norm(key) && !tune_normalization {
            return true;
        }
        self.exclude_bias && self.is_bias(key)
    }

    /// Whether `key` belongs to an attention sub-module.
    #[must_use]
    pub fn is_attention(&self, key: &str) -> bool {
        segment_contains(key, "attention")
    }

    /// Whether `key` belongs to a feed-forward sub-module.
    #[must_use]
    pub fn is_feed_forward(&self, key: &str) -> bool {
        segment_contains(key, "feed_forward")
    }
}

/// Token match scoped to path segments (e.g. `norm` matches
/// `input_layernorm` but not a token spanning a `.` boundary).
fn segment_contains(key: &str, token: &str) -> bool {
    key.split('.').any(|segment| segment.contains(token))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn segment_matcher_extracts_index() {
        let m = Matcher::Segment("layers");
        assert_eq!(m.extract("layers.7.attention.q_proj.weight"), Some(7));
        assert_eq!(m.extract("model.layers.7.q_proj.weight"), Some(7));
        assert_eq!(m.extract("final_layer.weight"), None);
        assert_eq!(m.extract("layers.not_a_number.weight"), None);
    }

    #[test]
    fn stack_capture_handles_both_conventions() {
        let m = Matcher::StackCapture;
        assert_eq!(m.extract("model.layers.12.mlp.up_proj.weight"), Some(12));
        assert_eq!(m.extract("transformer.h.3.attn.c_proj.weight"), Some(3));
        assert_eq!(m.extract("layers.0.self_attn.k_proj.weight"), Some(0));
        assert_eq!(m.extract("embed_tokens.weight"), None);
    }

    #[test]
    fn diffusion_classification() {
        let c = KeyClassifier::diffusion();
        assert_eq!(
            c.classify("layers.7.attention.q_proj.weight"),
            KeyClass::Layer(7)
        );
        assert_eq!(
            c.classify("x_embedder.proj.weight"),
            KeyClass::Component(ComponentKind::Embedder)
        );
        assert_eq!(
            c.classify("noise_refiner.0.weight"),
            KeyClass::Component(ComponentKind::NoiseRefiner)
        );
        assert_eq!(
            c.classify("final_layer.weight"),
            KeyClass::Component(ComponentKind::FinalLayer)
        );
        assert_eq!(c.classify("pos_embed"), KeyClass::Other);
    }

    #[test]
    fn norm_and_bias_exclusion() {
        let c = KeyClassifier::diffusion();
        assert!(c.is_norm("layers.3.input_layernorm.weight"));
        assert!(c.is_norm("layers.3.adaLN_modulation.1.weight"));
        assert!(!c.is_norm("layers.3.attention.q_proj.weight"));
        // Diffusion biases are governed, not excluded.
        assert!(!c.is_excluded("layers.3.attention.q_proj.bias", false));
        assert!(c.is_excluded("layers.3.input_layernorm.weight", false));
        assert!(!c.is_excluded("layers.3.input_layernorm.weight", true));

        let te = KeyClassifier::text_encoder();
        assert!(te.is_excluded("model.layers.3.self_attn.q_proj.bias", false));
        assert!(te.is_excluded("model.norm.weight", false));
        assert!(!te.is_excluded("model.layers.3.self_attn.q_proj.weight", false));
    }

    #[test]
    fn attention_and_feed_forward_tokens() {
        let c = KeyClassifier::diffusion();
        assert!(c.is_attention("layers.1.attention.qkv.weight"));
        assert!(c.is_feed_forward("layers.1.feed_forward.w1.weight"));
        assert!(!c.is_attention("layers.1.feed_forward.w1.weight"));
    }

    #[test]
    fn param_detection() {
        let c = KeyClassifier::diffusion();
        assert!(c.is_param("layers.0.attention.q_proj.weight"));
        assert!(c.is_param("layers.0.attention.q_proj.bias"));
        assert!(!c.is_param("layers.0.rotary.inv_freq"));
    }
}
