use crate::error::PipelineError;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// The single persisted document holding all project state. Written to
/// `<output>/data.json` after every mutation so a crash loses at most one
/// in-flight unit of work.
#[derive(Serialize, Deserialize, Default, Clone, Debug, PartialEq)]
pub struct Manifest {
    #[serde(default)]
    pub style_prompt: String,
    #[serde(default)]
    pub characters: Vec<CharacterEntry>,
    #[serde(default)]
    pub locations: Vec<LocationEntry>,
    #[serde(default)]
    pub illustrations: Vec<SceneEntry>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CharacterEntry {
    /// Canonical name, unique key across surface-form variants.
    pub name: String,
    /// Name as it first appeared in the text.
    pub original_name: String,
    pub description: String,
    /// Set once by the asset manager; must point at an existing file.
    pub full_body_path: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct LocationEntry {
    pub name: String,
    pub original_name: String,
    pub description: String,
    pub reference_image_path: Option<String>,
}

/// Weak reference from a scene to a catalog entry. Never ownership; the path
/// is a copy of the entry's path at illustration time.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct NamedRef {
    pub name: String,
    pub path: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SceneEntry {
    /// 1-based, sequential, matching the analyzer's scene order.
    pub scene_id: u32,
    /// Verbatim source text covered by this scene.
    pub story_segment: String,
    pub location: NamedRef,
    pub characters: Vec<NamedRef>,
    /// Set only after successful generation; absent means pending.
    pub illustration_path: Option<String>,
    pub folder: String,
    #[serde(default)]
    pub time_of_day: String,
    #[serde(default)]
    pub mood: String,
    #[serde(default)]
    pub action_description: String,
    #[serde(default)]
    pub visual_description: String,
}

impl Manifest {
    pub fn character(&self, name: &str) -> Option<&CharacterEntry> {
        self.characters.iter().find(|c| c.name == name)
    }

    pub fn location(&self, name: &str) -> Option<&LocationEntry> {
        self.locations.iter().find(|l| l.name == name)
    }

    pub fn scene(&self, scene_id: u32) -> Option<&SceneEntry> {
        self.illustrations.iter().find(|s| s.scene_id == scene_id)
    }
}

/// Sole writer of the manifest file. Every mutation entry point persists the
/// document before returning, which is what makes the pipeline resumable.
#[derive(Debug, Clone)]
pub struct ManifestStore {
    path: PathBuf,
}

impl ManifestStore {
    pub fn new(output_dir: &Path) -> Self {
        Self {
            path: output_dir.join("data.json"),
        }
    }

    /// A missing file yields a fresh empty manifest; an unparseable file is a
    /// hard error the caller must resolve by deleting or repairing it.
    pub fn load(&self) -> Result<Manifest> {
        if !self.path.exists() {
            return Ok(Manifest::default());
        }
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        let manifest = serde_json::from_str(&content).map_err(|source| {
            PipelineError::CorruptManifest {
                path: self.path.display().to_string(),
                source,
            }
        })?;
        Ok(manifest)
    }

    /// Write-to-temp-then-rename so a crash mid-write never leaves a
    /// half-written manifest behind.
    pub fn save(&self, manifest: &Manifest) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(manifest)?)?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to persist {}", self.path.display()))?;
        Ok(())
    }

    pub fn upsert_character(&self, manifest: &mut Manifest, entry: CharacterEntry) -> Result<()> {
        match manifest.characters.iter_mut().find(|c| c.name == entry.name) {
            Some(existing) if *existing == entry => return Ok(()),
            Some(existing) => *existing = entry,
            None => manifest.characters.push(entry),
        }
        self.save(manifest)
    }

    pub fn upsert_location(&self, manifest: &mut Manifest, entry: LocationEntry) -> Result<()> {
        match manifest.locations.iter_mut().find(|l| l.name == entry.name) {
            Some(existing) if *existing == entry => return Ok(()),
            Some(existing) => *existing = entry,
            None => manifest.locations.push(entry),
        }
        self.save(manifest)
    }

    pub fn upsert_scene(&self, manifest: &mut Manifest, entry: SceneEntry) -> Result<()> {
        match manifest
            .illustrations
            .iter_mut()
            .find(|s| s.scene_id == entry.scene_id)
        {
            Some(existing) if *existing == entry => return Ok(()),
            Some(existing) => *existing = entry,
            None => {
                manifest.illustrations.push(entry);
                manifest.illustrations.sort_by_key(|s| s.scene_id);
            }
        }
        self.save(manifest)
    }
}
