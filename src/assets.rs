use crate::error::PipelineError;
use crate::genai::GenAiClient;
use crate::manifest::{CharacterEntry, LocationEntry, Manifest, ManifestStore};
use anyhow::Result;
use log::{info, warn};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Normalized key identifying a character or location across surface-form
/// variants ("The Hero" and "hero" collapse to the same entity).
pub fn canonical_name(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '_' | '-'))
        .collect();
    cleaned
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
        .to_lowercase()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AssetOutcome {
    CacheHit,
    Generated,
}

/// Ensures every character and location has exactly one cached reference image
/// on disk, generating missing ones and recording them through the manifest
/// store. No-op for assets already present and valid.
pub struct AssetManager {
    client: Arc<dyn GenAiClient>,
    store: ManifestStore,
    output_dir: PathBuf,
}

impl AssetManager {
    pub fn new(client: Arc<dyn GenAiClient>, store: ManifestStore, output_dir: &Path) -> Self {
        Self {
            client,
            store,
            output_dir: output_dir.to_path_buf(),
        }
    }

    pub async fn ensure_character(
        &self,
        manifest: &mut Manifest,
        original_name: &str,
        description: &str,
        style: &str,
    ) -> Result<(CharacterEntry, AssetOutcome)> {
        let name = canonical_name(original_name);

        // First-wins on conflicting descriptions for the same canonical name.
        let (original_name, description) = match manifest.character(&name) {
            Some(existing) => {
                if let Some(path) = &existing.full_body_path {
                    if Path::new(path).exists() {
                        info!("Character '{}' already has a reference image. Skipping.", name);
                        return Ok((existing.clone(), AssetOutcome::CacheHit));
                    }
                }
                if existing.description != description {
                    warn!(
                        "Character '{}' re-surfaced with a different description; keeping the first one.",
                        name
                    );
                }
                (existing.original_name.clone(), existing.description.clone())
            }
            None => (original_name.to_string(), description.to_string()),
        };

        let dir = self.output_dir.join("characters").join(&name);
        fs::create_dir_all(&dir)?;
        let img_file = dir.join("card_full.jpg");

        let prompt = format!(
            "Full body shot of {original_name}, {description}. {style}. \
            9:16 aspect ratio. Single character only, standing, neutral expression, \
            clear features for reference. No text, no labels, no frames, no UI. \
            Exactly one depiction of the character. High quality, detailed."
        );

        info!("Generating full body reference for character '{}'...", name);
        let bytes = self
            .client
            .generate_image(&prompt, &[], "9:16")
            .await
            .map_err(|source| PipelineError::AssetGenerationFailed {
                name: name.clone(),
                source,
            })?;
        fs::write(&img_file, bytes)?;

        let entry = CharacterEntry {
            name,
            original_name,
            description,
            full_body_path: Some(img_file.to_string_lossy().into_owned()),
        };
        self.store.upsert_character(manifest, entry.clone())?;
        Ok((entry, AssetOutcome::Generated))
    }

    pub async fn ensure_location(
        &self,
        manifest: &mut Manifest,
        original_name: &str,
        description: &str,
        style: &str,
    ) -> Result<(LocationEntry, AssetOutcome)> {
        let name = canonical_name(original_name);

        let (original_name, description) = match manifest.location(&name) {
            Some(existing) => {
                if let Some(path) = &existing.reference_image_path {
                    if Path::new(path).exists() {
                        info!("Location '{}' already has a reference image. Skipping.", name);
                        return Ok((existing.clone(), AssetOutcome::CacheHit));
                    }
                }
                if existing.description != description {
                    warn!(
                        "Location '{}' re-surfaced with a different description; keeping the first one.",
                        name
                    );
                }
                (existing.original_name.clone(), existing.description.clone())
            }
            None => (original_name.to_string(), description.to_string()),
        };

        let dir = self.output_dir.join("locations").join(&name);
        fs::create_dir_all(&dir)?;
        let img_file = dir.join("ref_01.jpg");

        let prompt = format!(
            "Establishing shot of {original_name}, {description}. {style}. \
            16:9 aspect ratio, cinematic wide shot. Single view, no text, no labels, \
            no split screen, no frames. No people, no characters, no figures. \
            Empty scene, architecture and nature only. High quality environment design."
        );

        info!("Generating reference for location '{}'...", name);
        let bytes = self
            .client
            .generate_image(&prompt, &[], "16:9")
            .await
            .map_err(|source| PipelineError::AssetGenerationFailed {
                name: name.clone(),
                source,
            })?;
        fs::write(&img_file, bytes)?;

        let entry = LocationEntry {
            name,
            original_name,
            description,
            reference_image_path: Some(img_file.to_string_lossy().into_owned()),
        };
        self.store.upsert_location(manifest, entry.clone())?;
        Ok((entry, AssetOutcome::Generated))
    }

    /// Shared style anchor prepended to every illustration's reference list.
    /// An existing file is always picked up; generation only happens when the
    /// config opts in.
    pub async fn ensure_style_template(
        &self,
        style: &str,
        generate: bool,
    ) -> Result<Option<PathBuf>> {
        let dir = self.output_dir.join("style_templates");
        let img_file = dir.join("style_ref.jpg");

        if img_file.exists() {
            return Ok(Some(img_file));
        }
        if !generate {
            return Ok(None);
        }

        fs::create_dir_all(&dir)?;
        let prompt = format!(
            "{style}. Style foundation artwork: an evocative empty environment in this \
            exact visual style. 16:9 aspect ratio. The colors, lighting and brushwork of \
            this image are the source of truth for all later images. No text, no frames."
        );

        info!("Preparing global style template...");
        let bytes = self
            .client
            .generate_image(&prompt, &[], "16:9")
            .await
            .map_err(|source| PipelineError::AssetGenerationFailed {
                name: "style_template".to_string(),
                source,
            })?;
        fs::write(&img_file, bytes)?;
        Ok(Some(img_file))
    }
}
