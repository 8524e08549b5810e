use serde::{Deserialize, Serialize};

pub mod credentials;
pub mod store;
pub mod vision;

pub use credentials::{
    AccessTokenSource, CredentialsError, ServiceAccountKey, load_service_account,
    persist_service_account_json,
};
pub use store::{CatEntry, CatId, StagedUpload, UploadStore};
pub use vision::{LabelDetector, VisionAuth, VisionClient, VisionConfig, VisionError};

/// Label the accepting endpoint looks for unless configured otherwise.
pub const DEFAULT_ACCEPT_LABEL: &str = "cat";

/// A single label returned by the classification service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelAnnotation {
    /// Knowledge graph id, e.g. `/m/01yrx`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mid: Option<String>,
    pub description: String,
    /// Confidence in [0,1].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
}

impl LabelAnnotation {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            mid: None,
            description: description.into(),
            score: None,
        }
    }
}

/// Outcome of checking an upload's labels against the accepted label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    /// Keep the upload.
    Accepted,
    /// Delete the upload.
    Rejected,
}

impl Verdict {
    pub fn from_labels(labels: &[LabelAnnotation], target: &str) -> Self {
        if is_cat(labels, target) {
            Verdict::Accepted
        } else {
            Verdict::Rejected
        }
    }

    pub fn is_accepted(self) -> bool {
        matches!(self, Verdict::Accepted)
    }
}

/// True when any label description equals `target`, ignoring case and
/// surrounding whitespace. Partial matches ("cats", "big cat") do not count.
pub fn is_cat(labels: &[LabelAnnotation], target: &str) -> bool {
    let target = target.trim();
    if target.is_empty() {
        return false;
    }
    labels
        .iter()
        .any(|l| l.description.trim().eq_ignore_ascii_case(target))
}

/// Lowercased label descriptions, in service order. Used for logging.
pub fn label_names(labels: &[LabelAnnotation]) -> Vec<String> {
    labels
        .iter()
        .map(|l| l.description.to_lowercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn labels(names: &[&str]) -> Vec<LabelAnnotation> {
        names.iter().map(|n| LabelAnnotation::new(*n)).collect()
    }

    #[rstest]
    #[case(&["Cat", "Whiskers", "Small to medium-sized cats"], true)]
    #[case(&["cat"], true)]
    #[case(&["  CAT "], true)]
    #[case(&["Dog", "Snout"], false)]
    #[case(&["Cats", "Big cat"], false)]
    #[case(&[], false)]
    fn is_cat_matches_whole_label_only(#[case] names: &[&str], #[case] expected: bool) {
        assert_eq!(is_cat(&labels(names), DEFAULT_ACCEPT_LABEL), expected);
    }

    #[test]
    fn custom_target_label_is_respected() {
        let l = labels(&["Dog", "Cat"]);
        assert!(is_cat(&l, "dog"));
        assert!(!is_cat(&l, "bird"));
        assert!(!is_cat(&l, "   "));
    }

    #[test]
    fn verdict_follows_labels() {
        assert_eq!(
            Verdict::from_labels(&labels(&["Cat"]), "cat"),
            Verdict::Accepted
        );
        assert!(!Verdict::from_labels(&labels(&["Car"]), "cat").is_accepted());
    }

    #[test]
    fn label_annotation_reads_service_json() -> anyhow::Result<()> {
        let raw = r#"{"mid":"/m/01yrx","description":"Cat","score":0.98,"topicality":0.98}"#;
        let label: LabelAnnotation = serde_json::from_str(raw)?;
        assert_eq!(label.mid.as_deref(), Some("/m/01yrx"));
        assert_eq!(label.description, "Cat");
        assert_eq!(label.score, Some(0.98));
        assert_eq!(label_names(&[label]), vec!["cat"]);
        Ok(())
    }
}
