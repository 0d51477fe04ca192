use crate::assets::canonical_name;
use crate::error::PipelineError;
use crate::genai::GenAiClient;
use crate::manifest::{Manifest, ManifestStore, NamedRef};
use anyhow::{anyhow, Result};
use log::info;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub fn scene_folder(scene_id: u32, location_name: &str) -> String {
    format!("{:03}_{}", scene_id, canonical_name(location_name))
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SceneOutcome {
    Skipped,
    Generated,
}

/// Drives per-scene illustration generation. Every referenced character and
/// location must already have a valid asset; the asset manager runs over the
/// full sets before any scene is processed.
pub struct Illustrator {
    client: Arc<dyn GenAiClient>,
    store: ManifestStore,
    output_dir: PathBuf,
}

impl Illustrator {
    pub fn new(client: Arc<dyn GenAiClient>, store: ManifestStore, output_dir: &Path) -> Self {
        Self {
            client,
            store,
            output_dir: output_dir.to_path_buf(),
        }
    }

    pub async fn illustrate(
        &self,
        manifest: &mut Manifest,
        scene_id: u32,
        style: &str,
        style_template: Option<&Path>,
    ) -> Result<(PathBuf, SceneOutcome)> {
        let mut scene = manifest
            .scene(scene_id)
            .ok_or_else(|| anyhow!("unknown scene id {}", scene_id))?
            .clone();

        if let Some(existing) = &scene.illustration_path {
            if Path::new(existing).exists() {
                info!("Illustration for scene {} exists. Skipping.", scene_id);
                return Ok((PathBuf::from(existing), SceneOutcome::Skipped));
            }
        }

        // Reference order: style template, location, then characters in scene
        // order. The constraint text rides in the prompt, not in post-checks.
        let mut reference_images = Vec::new();
        if let Some(template) = style_template {
            reference_images.push(fs::read(template)?);
        }

        let location_path = manifest
            .location(&scene.location.name)
            .and_then(|l| l.reference_image_path.clone())
            .filter(|p| Path::new(p).exists())
            .ok_or_else(|| PipelineError::IllustrationFailed {
                scene_id,
                source: anyhow!("location '{}' has no reference image", scene.location.name),
            })?;
        reference_images.push(fs::read(&location_path)?);
        scene.location.path = Some(location_path);

        for character in &mut scene.characters {
            let path = manifest
                .character(&character.name)
                .and_then(|c| c.full_body_path.clone())
                .filter(|p| Path::new(p).exists())
                .ok_or_else(|| PipelineError::IllustrationFailed {
                    scene_id,
                    source: anyhow!("character '{}' has no reference image", character.name),
                })?;
            reference_images.push(fs::read(&path)?);
            character.path = Some(path);
        }

        let prompt = build_prompt(style, &scene.location.name, &scene);

        info!("Generating illustration for scene {} (single frame)...", scene_id);
        let bytes = self
            .client
            .generate_image(&prompt, &reference_images, "16:9")
            .await
            .map_err(|source| PipelineError::IllustrationFailed { scene_id, source })?;

        let dir = self.output_dir.join("illustrations").join(&scene.folder);
        fs::create_dir_all(&dir)?;
        let img_file = dir.join("illustration.jpg");
        fs::write(&img_file, bytes)?;

        scene.illustration_path = Some(img_file.to_string_lossy().into_owned());
        self.store.upsert_scene(manifest, scene)?;
        Ok((img_file, SceneOutcome::Generated))
    }
}

fn build_prompt(style: &str, location_name: &str, scene: &crate::manifest::SceneEntry) -> String {
    let context = if scene.visual_description.is_empty() {
        scene.story_segment.as_str()
    } else {
        scene.visual_description.as_str()
    };
    format!(
        "{style}. **Single cinematic frame. One single cohesive image.**\n\
        **STRICTLY NO multi-panels, NO comic book layout, NO grid, NO split screen, \
        NO storyboard, NO frames.**\n\
        **NO text, NO captions, NO speech bubbles.**\n\
        Scene context: {context}\n\
        Action taking place: {action}\n\
        Setting: {location_name}, {time}. Mood: {mood}.",
        action = scene.action_description,
        time = scene.time_of_day,
        mood = scene.mood,
    )
}
