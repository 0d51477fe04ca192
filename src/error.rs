use thiserror::Error;

/// Terminal failure kinds surfaced by the pipeline. Transient service errors
/// are retried inside the client and never reach this taxonomy.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The analysis call returned malformed, empty, or internally inconsistent
    /// output. Nothing downstream can run without a valid breakdown.
    #[error("story analysis failed: {0}")]
    AnalysisFailed(String),

    /// The persisted manifest exists but cannot be parsed. Delete or repair
    /// the file to recover.
    #[error("manifest at {path} is corrupt: {source}")]
    CorruptManifest {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    /// A single reference asset could not be generated. Other assets and
    /// scenes continue to be processed.
    #[error("asset generation failed for '{name}': {source}")]
    AssetGenerationFailed {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    /// A single scene could not be illustrated. Remaining scenes continue.
    #[error("illustration failed for scene {scene_id}: {source}")]
    IllustrationFailed {
        scene_id: u32,
        #[source]
        source: anyhow::Error,
    },
}
