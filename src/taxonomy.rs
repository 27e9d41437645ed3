// SPDX-License-Identifier: MIT OR Apache-2.0

//! Layer taxonomies: named, ordered partitions of a model's layer-index
//! space into control groups.
//!
//! A taxonomy maps each user-facing control (a slider name such as
//! `STAGE_2_Spatial_Layout` or `Layer_07`) to the contiguous index range
//! it governs. Coarse "semantic zone" taxonomies and one-control-per-index
//! "lab" taxonomies both reduce to the same `index → scale` table
//! downstream, so the rest of the engine never distinguishes them.
//!
//! Invariant: within one taxonomy the ranges are non-overlapping and
//! jointly cover `[0, layer_count)`. [`LayerTaxonomy::new`] enforces
//! this; the built-in constructors are exercised by the coverage tests.

use std::fmt;
use std::ops::Range;

use crate::error::{Result, TuneError};

// ---------------------------------------------------------------------------
// ControlGroup
// ---------------------------------------------------------------------------

/// One named control and the contiguous layer range it governs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlGroup {
    /// User-facing control name (slider label).
    pub name: String,
    /// Governed layer indices, half-open.
    pub range: Range<usize>,
}

impl ControlGroup {
    /// Create a group.
    #[must_use]
    pub fn new(name: impl Into<String>, range: Range<usize>) -> Self {
        Self {
            name: name.into(),
            range,
        }
    }
}

impl fmt::Display for ControlGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}..{})", self.name, self.range.start, self.range.end)
    }
}

// ---------------------------------------------------------------------------
// LayerTaxonomy
// ---------------------------------------------------------------------------

/// An ordered partition of `[0, layer_count)` into named control groups.
#[derive(Debug, Clone)]
pub struct LayerTaxonomy {
    /// Taxonomy name, used in reports.
    name: String,
    /// Total layer count of the governed stack.
    layer_count: usize,
    /// Groups in slider order.
    groups: Vec<ControlGroup>,
}

impl LayerTaxonomy {
    /// Create a validated taxonomy.
    ///
    /// # Errors
    ///
    /// Returns [`TuneError::Config`] if the groups overlap, leave gaps,
    /// or do not jointly cover `[0, layer_count)`.
    pub fn new(
        name: impl Into<String>,
        layer_count: usize,
        groups: Vec<ControlGroup>,
    ) -> Result<Self> {
        let taxonomy = Self {
            name: name.into(),
            layer_count,
            groups,
        };
        taxonomy.validate()?;
        Ok(taxonomy)
    }

    /// Internal constructor for the built-in tables, which are static
    /// and covered by the coverage tests below.
    fn from_table(name: &str, layer_count: usize, table: &[(&str, Range<usize>)]) -> Self {
        Self {
            name: name.to_string(),
            layer_count,
            groups: table
                .iter()
                .map(|(n, r)| ControlGroup::new(*n, r.clone()))
                .collect(),
        }
    }

    /// Check the coverage invariant: ranges are disjoint and their union
    /// is exactly `[0, layer_count)`.
    ///
    /// # Errors
    ///
    /// Returns [`TuneError::Config`] describing the first violation.
    pub fn validate(&self) -> Result<()> {
        let mut covered = vec![false; self.layer_count];
        for group in &self.groups {
            if group.range.end > self.layer_count {
                return Err(TuneError::Config(format!(
                    "taxonomy `{}`: group {group} exceeds layer count {}",
                    self.name, self.layer_count
                )));
            }
            for idx in group.range.clone() {
                if covered[idx] {
                    return Err(TuneError::Config(format!(
                        "taxonomy `{}`: layer {idx} governed by more than one group",
                        self.name
                    )));
                }
                covered[idx] = true;
            }
        }
        if let Some(gap) = covered.iter().position(|c| !c) {
            return Err(TuneError::Config(format!(
                "taxonomy `{}`: layer {gap} is not governed by any group",
                self.name
            )));
        }
        Ok(())
    }

    /// Taxonomy name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Total layer count of the governed stack.
    #[must_use]
    pub const fn layer_count(&self) -> usize {
        self.layer_count
    }

    /// Groups in slider order.
    #[must_use]
    pub fn groups(&self) -> &[ControlGroup] {
        &self.groups
    }

    /// The group governing `index`, if any.
    #[must_use]
    pub fn group_of(&self, index: usize) -> Option<&ControlGroup> {
        self.groups.iter().find(|g| g.range.contains(&index))
    }

    /// The last group in slider order.
    ///
    /// The final output head is architecturally adjacent to the last
    /// transformer block, so it inherits this group's scale.
    #[must_use]
    pub fn last_group(&self) -> Option<&ControlGroup> {
        self.groups.last()
    }

    // -- Built-in taxonomies ------------------------------------------------

    /// Diffusion backbone, 30 layers in 6 blocks of 5.
    #[must_use]
    pub fn diffusion_blocks() -> Self {
        Self::from_table(
            "diffusion-blocks",
            30,
            &[
                ("block_1_start_00_04", 0..5),
                ("block_2_early_05_09", 5..10),
                ("block_3_mid_10_14", 10..15),
                ("block_4_core_15_19", 15..20),
                ("block_5_late_20_24", 20..25),
                ("block_6_end_25_29", 25..30),
            ],
        )
    }

    /// Diffusion backbone, 30 layers in 5 semantic stages of 6.
    #[must_use]
    pub fn diffusion_stages() -> Self {
        Self::from_table(
            "diffusion-stages",
            30,
            &[
                ("STAGE_1_Semantic_Seeding", 0..6),
                ("STAGE_2_Spatial_Layout", 6..12),
                ("STAGE_3_Morphological_Form", 12..18),
                ("STAGE_4_Volumetric_Lighting", 18..24),
                ("STAGE_5_Surface_Refinement", 24..30),
            ],
        )
    }

    /// Text encoder, 36 layers in 6 semantic zones of 6.
    #[must_use]
    pub fn encoder_zones() -> Self {
        Self::from_table(
            "encoder-zones",
            36,
            &[
                ("Zone_1_Embedding_00_05", 0..6),
                ("Zone_2_Syntax_Low_06_11", 6..12),
                ("Zone_3_Syntax_High_12_17", 12..18),
                ("Zone_4_Semantics_18_23", 18..24),
                ("Zone_5_Context_24_29", 24..30),
                ("Zone_6_Abstract_30_35", 30..36),
            ],
        )
    }

    /// Text encoder, 36 layers in 4 semantic bands of 9.
    #[must_use]
    pub fn encoder_bands() -> Self {
        Self::from_table(
            "encoder-bands",
            36,
            &[
                ("LLM_Syntax_Parsing", 0..9),
                ("LLM_Literal_Meaning", 9..18),
                ("LLM_Contextual_Web", 18..27),
                ("LLM_Abstract_Concept", 27..36),
            ],
        )
    }

    /// Lab taxonomy: one control per layer, named `Layer_00`, `Layer_01`, …
    #[must_use]
    pub fn per_layer(layer_count: usize) -> Self {
        let groups = (0..layer_count)
            .map(|i| ControlGroup::new(format!("Layer_{i:02}"), i..i + 1))
            .collect();
        Self {
            name: format!("per-layer-{layer_count}"),
            layer_count,
            groups,
        }
    }

    /// Text-encoder lab taxonomy: one control per layer, names carrying
    /// the 4-band semantic prefix (`LLM_Syntax_L00` … `LLM_Abstract_L35`).
    #[must_use]
    pub fn encoder_lab() -> Self {
        let groups = (0..36)
            .map(|i| {
                let prefix = match i {
                    0..=8 => "LLM_Syntax",
                    9..=17 => "LLM_Semantics",
                    18..=26 => "LLM_Context",
                    _ => "LLM_Abstract",
                };
                ControlGroup::new(format!("{prefix}_L{i:02}"), i..i + 1)
            })
            .collect();
        Self {
            name: "encoder-lab".to_string(),
            layer_count: 36,
            groups,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn built_in_taxonomies_cover_their_stack() {
        for taxonomy in [
            LayerTaxonomy::diffusion_blocks(),
            LayerTaxonomy::diffusion_stages(),
            LayerTaxonomy::encoder_zones(),
            LayerTaxonomy::encoder_bands(),
            LayerTaxonomy::per_layer(30),
            LayerTaxonomy::encoder_lab(),
        ] {
            taxonomy
                .validate()
                .unwrap_or_else(|e| panic!("{}: {e}", taxonomy.name()));
        }
    }

    #[test]
    fn overlap_is_rejected() {
        let result = LayerTaxonomy::new(
            "bad",
            10,
            vec![
                ControlGroup::new("a", 0..6),
                ControlGroup::new("b", 5..10),
            ],
        );
        assert!(result.is_err());
    }

    #[test]
    fn gap_is_rejected() {
        let result = LayerTaxonomy::new(
            "bad",
            10,
            vec![
                ControlGroup::new("a", 0..4),
                ControlGroup::new("b", 5..10),
            ],
        );
        assert!(result.is_err());
    }

    #[test]
    fn out_of_range_group_is_rejected() {
        let result =
            LayerTaxonomy::new("bad", 10, vec![ControlGroup::new("a", 0..11)]);
        assert!(result.is_err());
    }

    #[test]
    fn group_lookup() {
        let t = LayerTaxonomy::encoder_zones();
        assert_eq!(t.group_of(0).unwrap().name, "Zone_1_Embedding_00_05");
        assert_eq!(t.group_of(17).unwrap().name, "Zone_3_Syntax_High_12_17");
        assert_eq!(t.group_of(35).unwrap().name, "Zone_6_Abstract_30_35");
        assert!(t.group_of(36).is_none());
        assert_eq!(t.last_group().unwrap().name, "Zone_6_Abstract_30_35");
    }

    #[test]
    fn lab_names() {
        let t = LayerTaxonomy::per_layer(30);
        assert_eq!(t.groups()[7].name, "Layer_07");
        let lab = LayerTaxonomy::encoder_lab();
        assert_eq!(lab.groups()[0].name, "LLM_Syntax_L00");
        assert_eq!(lab.groups()[35].name, "LLM_Abstract_L35");
    }
}
