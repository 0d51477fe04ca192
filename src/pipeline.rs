use crate::analyzer::StoryAnalyzer;
use crate::assets::{canonical_name, AssetManager, AssetOutcome};
use crate::config::Config;
use crate::genai::GenAiClient;
use crate::illustrator::{scene_folder, Illustrator, SceneOutcome};
use crate::manifest::{CharacterEntry, LocationEntry, ManifestStore, NamedRef, SceneEntry};
use anyhow::Result;
use log::{info, warn};
use std::path::Path;
use std::sync::Arc;

/// End-of-run accounting. Item-level failures are collected here instead of
/// aborting remaining work; each unit is independently cacheable and can be
/// retried on the next invocation.
#[derive(Debug, Default)]
pub struct RunReport {
    pub generated: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl RunReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn print_summary(&self) {
        println!(
            "Run complete: {} generated, {} skipped (already complete), {} failed.",
            self.generated.len(),
            self.skipped.len(),
            self.failed.len()
        );
        for item in &self.generated {
            println!("  generated: {}", item);
        }
        for item in &self.skipped {
            println!("  skipped:   {}", item);
        }
        for (item, reason) in &self.failed {
            println!("  FAILED:    {} ({})", item, reason);
        }
    }
}

/// Orchestrates analyzer, asset manager and illustrator around the manifest.
/// Strictly sequential: one generative-service call in flight at a time.
pub struct Pipeline {
    config: Config,
    store: ManifestStore,
    analyzer: StoryAnalyzer,
    assets: AssetManager,
    illustrator: Illustrator,
}

impl Pipeline {
    pub fn new(config: Config, client: Arc<dyn GenAiClient>, output_dir: &Path) -> Self {
        let store = ManifestStore::new(output_dir);
        Self {
            config,
            analyzer: StoryAnalyzer::new(client.clone()),
            assets: AssetManager::new(client.clone(), store.clone(), output_dir),
            illustrator: Illustrator::new(client, store.clone(), output_dir),
            store,
        }
    }

    pub async fn run(&self, story_text: &str, style_hint: &str) -> Result<RunReport> {
        let mut manifest = self.store.load()?;

        if manifest.illustrations.is_empty() {
            let breakdown = self.analyzer.analyze(story_text, style_hint).await?;

            // Style is set once per project; only a deleted manifest resets it.
            manifest.style_prompt = breakdown.style.clone();
            self.store.save(&manifest)?;

            for sketch in &breakdown.characters {
                let name = canonical_name(&sketch.name);
                if manifest.character(&name).is_some() {
                    continue;
                }
                self.store.upsert_character(
                    &mut manifest,
                    CharacterEntry {
                        name,
                        original_name: sketch.name.clone(),
                        description: sketch.description.clone(),
                        full_body_path: None,
                    },
                )?;
            }

            for sketch in &breakdown.locations {
                let name = canonical_name(&sketch.name);
                if manifest.location(&name).is_some() {
                    continue;
                }
                self.store.upsert_location(
                    &mut manifest,
                    LocationEntry {
                        name,
                        original_name: sketch.name.clone(),
                        description: sketch.description.clone(),
                        reference_image_path: None,
                    },
                )?;
            }

            for scene in &breakdown.scenes {
                self.store.upsert_scene(
                    &mut manifest,
                    SceneEntry {
                        scene_id: scene.id,
                        story_segment: scene.segment.clone(),
                        location: NamedRef {
                            name: canonical_name(&scene.location),
                            path: None,
                        },
                        characters: scene
                            .characters
                            .iter()
                            .map(|n| NamedRef {
                                name: canonical_name(n),
                                path: None,
                            })
                            .collect(),
                        illustration_path: None,
                        folder: scene_folder(scene.id, &scene.location),
                        time_of_day: scene.time_of_day.clone(),
                        mood: scene.mood.clone(),
                        action_description: scene.action_description.clone(),
                        visual_description: scene.visual_description.clone(),
                    },
                )?;
            }
        } else {
            info!(
                "Resuming from manifest: {} characters, {} locations, {} scenes.",
                manifest.characters.len(),
                manifest.locations.len(),
                manifest.illustrations.len()
            );
        }

        let mut report = RunReport::default();
        let style = manifest.style_prompt.clone();

        let style_template = match self
            .assets
            .ensure_style_template(&style, self.config.style_template)
            .await
        {
            Ok(template) => template,
            Err(e) => {
                warn!("{}", e);
                report.failed.push(("style template".to_string(), e.to_string()));
                None
            }
        };

        // Characters first, then locations, then scenes. Scene generation
        // depends on every referenced asset already being settled.
        let characters = manifest.characters.clone();
        for entry in characters {
            let label = format!("character '{}'", entry.name);
            match self
                .assets
                .ensure_character(&mut manifest, &entry.original_name, &entry.description, &style)
                .await
            {
                Ok((_, AssetOutcome::Generated)) => report.generated.push(label),
                Ok((_, AssetOutcome::CacheHit)) => report.skipped.push(label),
                Err(e) => {
                    warn!("{}", e);
                    report.failed.push((label, e.to_string()));
                }
            }
        }

        let locations = manifest.locations.clone();
        for entry in locations {
            let label = format!("location '{}'", entry.name);
            match self
                .assets
                .ensure_location(&mut manifest, &entry.original_name, &entry.description, &style)
                .await
            {
                Ok((_, AssetOutcome::Generated)) => report.generated.push(label),
                Ok((_, AssetOutcome::CacheHit)) => report.skipped.push(label),
                Err(e) => {
                    warn!("{}", e);
                    report.failed.push((label, e.to_string()));
                }
            }
        }

        let scene_ids: Vec<u32> = manifest.illustrations.iter().map(|s| s.scene_id).collect();
        for scene_id in scene_ids {
            let label = format!("scene {}", scene_id);
            match self
                .illustrator
                .illustrate(&mut manifest, scene_id, &style, style_template.as_deref())
                .await
            {
                Ok((_, SceneOutcome::Generated)) => report.generated.push(label),
                Ok((_, SceneOutcome::Skipped)) => report.skipped.push(label),
                Err(e) => {
                    warn!("{}", e);
                    report.failed.push((label, e.to_string()));
                }
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use crate::genai::GenAiClient;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::tempdir;

    const STORY: &str = "Mara met Jon at the harbor. They argued. They made peace.";

    const BREAKDOWN: &str = r#"{
        "style": "watercolor, soft morning light",
        "characters": [
            { "name": "Mara", "description": "red hair, green coat" },
            { "name": "Jon", "description": "grey beard, oilskin jacket" }
        ],
        "locations": [
            { "name": "Harbor", "description": "fog, wooden piers, gulls" }
        ],
        "scenes": [
            { "location": "Harbor", "characters": ["Mara", "Jon"],
              "time_of_day": "dawn", "mood": "tense",
              "action_description": "meeting", "visual_description": "two figures meet",
              "segment": "Mara met Jon at the harbor." },
            { "location": "Harbor", "characters": ["Mara", "Jon"],
              "time_of_day": "morning", "mood": "angry",
              "action_description": "argument", "visual_description": "raised hands",
              "segment": "They argued." },
            { "location": "Harbor", "characters": ["Mara", "Jon"],
              "time_of_day": "noon", "mood": "calm",
              "action_description": "reconciliation", "visual_description": "handshake",
              "segment": "They made peace." }
        ]
    }"#;

    #[derive(Debug)]
    struct MockClient {
        text_calls: Mutex<usize>,
        image_calls: Mutex<usize>,
        fail_image_containing: Option<String>,
    }

    impl MockClient {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                text_calls: Mutex::new(0),
                image_calls: Mutex::new(0),
                fail_image_containing: None,
            })
        }

        fn failing_on(fragment: &str) -> Arc<Self> {
            Arc::new(Self {
                text_calls: Mutex::new(0),
                image_calls: Mutex::new(0),
                fail_image_containing: Some(fragment.to_string()),
            })
        }

        fn text_calls(&self) -> usize {
            *self.text_calls.lock().unwrap()
        }

        fn image_calls(&self) -> usize {
            *self.image_calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl GenAiClient for MockClient {
        async fn generate_text(&self, _system: &str, _user: &str) -> Result<String> {
            *self.text_calls.lock().unwrap() += 1;
            Ok(BREAKDOWN.to_string())
        }

        async fn generate_image(
            &self,
            prompt: &str,
            _reference_images: &[Vec<u8>],
            _aspect_ratio: &str,
        ) -> Result<Vec<u8>> {
            if let Some(fragment) = &self.fail_image_containing {
                if prompt.contains(fragment.as_str()) {
                    return Err(anyhow!("mock image service error"));
                }
            }
            *self.image_calls.lock().unwrap() += 1;
            Ok(vec![0u8; 8])
        }
    }

    fn pipeline(client: Arc<MockClient>, output_dir: &Path) -> Pipeline {
        Pipeline::new(Config::default(), client, output_dir)
    }

    #[tokio::test]
    async fn test_full_run_call_accounting() {
        let dir = tempdir().unwrap();
        let client = MockClient::new();
        let pipeline = pipeline(client.clone(), dir.path());

        let report = pipeline.run(STORY, "").await.unwrap();

        assert!(report.is_clean());
        // 2 characters + 1 location, then 3 scenes.
        assert_eq!(client.text_calls(), 1);
        assert_eq!(client.image_calls(), 6);

        let manifest = ManifestStore::new(dir.path()).load().unwrap();
        assert_eq!(manifest.characters.len(), 2);
        assert_eq!(manifest.locations.len(), 1);
        assert_eq!(manifest.illustrations.len(), 3);
        let ids: Vec<u32> = manifest.illustrations.iter().map(|s| s.scene_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        for scene in &manifest.illustrations {
            let path = scene.illustration_path.as_ref().unwrap();
            assert!(Path::new(path).exists());
        }
    }

    #[tokio::test]
    async fn test_second_run_is_all_cache_hits() {
        let dir = tempdir().unwrap();
        let client = MockClient::new();
        let pipeline = pipeline(client.clone(), dir.path());

        pipeline.run(STORY, "").await.unwrap();
        let before_text = client.text_calls();
        let before_image = client.image_calls();

        let report = pipeline.run(STORY, "").await.unwrap();

        assert!(report.is_clean());
        assert!(report.generated.is_empty());
        assert_eq!(report.skipped.len(), 6);
        // Zero additional calls of either kind, including analysis.
        assert_eq!(client.text_calls(), before_text);
        assert_eq!(client.image_calls(), before_image);
    }

    #[tokio::test]
    async fn test_deleted_illustration_regenerated_alone() {
        let dir = tempdir().unwrap();
        let client = MockClient::new();
        let pipeline = pipeline(client.clone(), dir.path());

        pipeline.run(STORY, "").await.unwrap();

        let manifest = ManifestStore::new(dir.path()).load().unwrap();
        let victim = manifest.illustrations[1].illustration_path.clone().unwrap();
        fs::remove_file(&victim).unwrap();
        let before = client.image_calls();

        let report = pipeline.run(STORY, "").await.unwrap();

        assert!(report.is_clean());
        assert_eq!(report.generated, vec!["scene 2".to_string()]);
        assert_eq!(client.image_calls(), before + 1);
        assert!(Path::new(&victim).exists());
    }

    #[tokio::test]
    async fn test_failed_asset_does_not_abort_run() {
        let dir = tempdir().unwrap();
        // Jon's card fails; Mara, the location and the scenes without valid
        // Jon references are still attempted.
        let client = MockClient::failing_on("Jon");
        let pipeline = pipeline(client.clone(), dir.path());

        let report = pipeline.run(STORY, "").await.unwrap();

        assert!(!report.is_clean());
        let failed_labels: Vec<&str> = report.failed.iter().map(|(l, _)| l.as_str()).collect();
        assert!(failed_labels.contains(&"character 'jon'"));
        // Every scene references Jon, so all three fail their precondition.
        assert_eq!(report.failed.len(), 4);
        assert!(report.generated.contains(&"character 'mara'".to_string()));
        assert!(report.generated.contains(&"location 'harbor'".to_string()));

        // The failed items stay pending in the manifest for the next run.
        let manifest = ManifestStore::new(dir.path()).load().unwrap();
        assert!(manifest.character("jon").unwrap().full_body_path.is_none());
        for scene in &manifest.illustrations {
            assert!(scene.illustration_path.is_none());
        }
    }

    #[tokio::test]
    async fn test_corrupt_manifest_stops_before_any_call() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("data.json"), "not json at all").unwrap();
        let client = MockClient::new();
        let pipeline = pipeline(client.clone(), dir.path());

        let err = pipeline.run(STORY, "").await.unwrap_err();

        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::CorruptManifest { .. })
        ));
        assert_eq!(client.text_calls(), 0);
        assert_eq!(client.image_calls(), 0);
    }

    #[tokio::test]
    async fn test_style_prompt_set_once() {
        let dir = tempdir().unwrap();
        let client = MockClient::new();
        let pipeline = pipeline(client.clone(), dir.path());

        pipeline.run(STORY, "").await.unwrap();
        pipeline.run(STORY, "ignored new hint").await.unwrap();

        let manifest = ManifestStore::new(dir.path()).load().unwrap();
        assert_eq!(manifest.style_prompt, "watercolor, soft morning light");
    }

    #[tokio::test]
    async fn test_style_template_counts_when_enabled() {
        let dir = tempdir().unwrap();
        let client = MockClient::new();
        let config = Config {
            style_template: true,
            ..Config::default()
        };
        let pipeline = Pipeline::new(config, client.clone(), dir.path());

        let report = pipeline.run(STORY, "").await.unwrap();

        assert!(report.is_clean());
        // 1 template + 3 assets + 3 scenes.
        assert_eq!(client.image_calls(), 7);
        assert!(dir.path().join("style_templates/style_ref.jpg").exists());
    }
}
