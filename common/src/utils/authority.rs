use serde::{Deserialize, Serialize};

/// Document authority tiers used by the gravity reranker.
///
/// Wire tokens match the persisted rows; relative ordering is
/// `constitution > policy > canonical > supplementary`, with `hard_constraint`
/// overriding any path-based inference when present on the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuthorityLevel {
    Constitution,
    Policy,
    Canonical,
    #[default]
    Supplementary,
    Administrative,
    HardConstraint,
    SoftKnowledge,
}

impl AuthorityLevel {
    /// Multiplicative weight applied by the gravity reranker.
    pub fn gravity_weight(self) -> f32 {
        match self {
            Self::HardConstraint => 1.35,
            Self::Constitution => 1.30,
            Self::Policy => 1.18,
            Self::Canonical => 1.12,
            Self::Supplementary => 1.0,
            Self::Administrative => 0.95,
            Self::SoftKnowledge => 0.90,
        }
    }

    pub fn as_token(self) -> &'static str {
        match self {
            Self::Constitution => "constitution",
            Self::Policy => "policy",
            Self::Canonical => "canonical",
            Self::Supplementary => "supplementary",
            Self::Administrative => "administrative",
            Self::HardConstraint => "hard_constraint",
            Self::SoftKnowledge => "soft_knowledge",
        }
    }

    pub fn from_token(token: &str) -> Option<Self> {
        match token.trim().to_ascii_lowercase().as_str() {
            "constitution" => Some(Self::Constitution),
            "policy" => Some(Self::Policy),
            "canonical" => Some(Self::Canonical),
            "supplementary" => Some(Self::Supplementary),
            "administrative" => Some(Self::Administrative),
            "hard_constraint" => Some(Self::HardConstraint),
            "soft_knowledge" => Some(Self::SoftKnowledge),
            _ => None,
        }
    }
}

// Rules ordered by priority; first match wins.
const CLASSIFICATION_RULES: &[(&[&str], AuthorityLevel)] = &[
    (
        &[
            "rubric", "rubrica", "evaluation", "evaluacion", "reglamento", "integridad",
            "integrity", "grading", "calificacion",
        ],
        AuthorityLevel::Constitution,
    ),
    (
        &[
            "policy",
            "procedimiento",
            "procedure",
            "programa",
            "admin",
            "calendario",
            "calendar",
            "guia",
            "guide",
            "estructura",
            "structure",
            "horario",
        ],
        AuthorityLevel::Policy,
    ),
    (
        &[
            "standard",
            "norma",
            "manual",
            "reference",
            "spec",
            "policy-manual",
            "oficial",
            "official",
            "aprobado",
            "approved",
        ],
        AuthorityLevel::Canonical,
    ),
];

/// Infer an authority level from storage path, document type, and filename.
///
/// An explicit `hard_constraint` in the document metadata always wins; this
/// function only performs the path-based inference.
pub fn classify_authority(
    storage_path: Option<&str>,
    doc_type: Option<&str>,
    filename: Option<&str>,
) -> AuthorityLevel {
    let search_text = [storage_path, doc_type, filename]
        .iter()
        .flatten()
        .map(|part| part.to_ascii_lowercase())
        .collect::<Vec<_>>()
        .join(" ");

    if search_text.trim().is_empty() {
        return AuthorityLevel::Supplementary;
    }

    for (patterns, authority) in CLASSIFICATION_RULES {
        if patterns.iter().any(|pattern| search_text.contains(pattern)) {
            return *authority;
        }
    }

    AuthorityLevel::Supplementary
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_matches_rules_in_priority_order() {
        assert_eq!(
            classify_authority(Some("institutional/rubrics/math.pdf"), None, None),
            AuthorityLevel::Constitution
        );
        assert_eq!(
            classify_authority(Some("docs/procedures/2024.pdf"), None, None),
            AuthorityLevel::Policy
        );
        assert_eq!(
            classify_authority(None, Some("standard"), None),
            AuthorityLevel::Canonical
        );
        assert_eq!(
            classify_authority(Some("misc/notes.txt"), None, None),
            AuthorityLevel::Supplementary
        );
        assert_eq!(classify_authority(None, None, None), AuthorityLevel::Supplementary);
    }

    #[test]
    fn gravity_weights_preserve_ordering() {
        assert!(
            AuthorityLevel::HardConstraint.gravity_weight()
                > AuthorityLevel::Constitution.gravity_weight()
        );
        assert!(
            AuthorityLevel::Constitution.gravity_weight() > AuthorityLevel::Policy.gravity_weight()
        );
        assert!(AuthorityLevel::Policy.gravity_weight() > AuthorityLevel::Canonical.gravity_weight());
        assert!(
            AuthorityLevel::Canonical.gravity_weight()
                > AuthorityLevel::Supplementary.gravity_weight()
        );
    }

    #[test]
    fn token_round_trip() {
        for level in [
            AuthorityLevel::Constitution,
            AuthorityLevel::Policy,
            AuthorityLevel::Canonical,
            AuthorityLevel::Supplementary,
            AuthorityLevel::Administrative,
            AuthorityLevel::HardConstraint,
            AuthorityLevel::SoftKnowledge,
        ] {
            assert_eq!(AuthorityLevel::from_token(level.as_token()), Some(level));
        }
    }
}
