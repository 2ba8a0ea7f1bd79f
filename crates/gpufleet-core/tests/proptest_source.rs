//! Property-based tests for model source construction and identity.

use gpufleet_core::{FleetError, ModelSource, RawModelSource, SourceKind};
use proptest::prelude::*;

fn arb_kind() -> impl Strategy<Value = SourceKind> {
    prop_oneof![
        Just(SourceKind::HuggingFace),
        Just(SourceKind::OllamaLibrary),
        Just(SourceKind::ModelScope),
        Just(SourceKind::LocalPath),
    ]
}

/// Either absent, empty, or a plausible identifier
fn arb_field() -> impl Strategy<Value = Option<String>> {
    prop_oneof![
        Just(None),
        Just(Some(String::new())),
        "[a-zA-Z0-9_./-]{1,24}".prop_map(Some),
    ]
}

fn arb_raw() -> impl Strategy<Value = RawModelSource> {
    (
        arb_kind(),
        arb_field(),
        arb_field(),
        arb_field(),
        arb_field(),
        arb_field(),
        arb_field(),
    )
        .prop_map(|(kind, hf, hf_file, ollama, ms, ms_file, local)| RawModelSource {
            source: Some(kind),
            huggingface_repo_id: hf,
            huggingface_filename: hf_file,
            ollama_library_model_name: ollama,
            model_scope_model_id: ms,
            model_scope_file_path: ms_file,
            local_path: local,
        })
}

fn tag_field(raw: &RawModelSource) -> Option<&String> {
    match raw.source {
        Some(SourceKind::HuggingFace) => raw.huggingface_repo_id.as_ref(),
        Some(SourceKind::OllamaLibrary) => raw.ollama_library_model_name.as_ref(),
        Some(SourceKind::ModelScope) => raw.model_scope_model_id.as_ref(),
        Some(SourceKind::LocalPath) => raw.local_path.as_ref(),
        None => None,
    }
}

proptest! {
    /// Construction succeeds exactly when the tag-matching identifier is non-empty.
    #[test]
    fn construction_requires_tag_field(raw in arb_raw()) {
        let expected_ok = tag_field(&raw).is_some_and(|v| !v.trim().is_empty());
        let kind = raw.source;
        let result = ModelSource::try_from(raw);
        prop_assert_eq!(result.is_ok(), expected_ok);
        match result {
            Ok(source) => prop_assert_eq!(Some(source.kind()), kind),
            Err(e) => prop_assert!(matches!(e, FleetError::Validation(_))),
        }
    }

    /// Identical readable sources hash identically; different ones do not.
    #[test]
    fn source_index_is_stable(
        a in "[a-z0-9]{1,12}/[a-z0-9-]{1,12}",
        b in "[a-z0-9]{1,12}/[a-z0-9-]{1,12}",
        file in proptest::option::of("[a-z0-9_]{1,10}\\.gguf"),
    ) {
        let first = ModelSource::huggingface(&a, file.as_deref()).unwrap();
        let again = ModelSource::huggingface(&a, file.as_deref()).unwrap();
        prop_assert_eq!(first.source_index(), again.source_index());

        let other = ModelSource::huggingface(&b, file.as_deref()).unwrap();
        if first.readable_source() != other.readable_source() {
            prop_assert_ne!(first.source_index(), other.source_index());
        } else {
            prop_assert_eq!(first.source_index(), other.source_index());
        }
    }
}

#[test]
fn missing_tag_is_rejected() {
    let raw = RawModelSource {
        local_path: Some("/models/a.gguf".to_string()),
        ..Default::default()
    };
    assert!(ModelSource::try_from(raw).is_err());
}
