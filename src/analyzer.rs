use crate::error::PipelineError;
use crate::genai::GenAiClient;
use anyhow::Result;
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

/// Validated output of the single text-analysis call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoryBreakdown {
    pub style: String,
    pub characters: Vec<CharacterSketch>,
    pub locations: Vec<LocationSketch>,
    pub scenes: Vec<SceneSketch>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CharacterSketch {
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationSketch {
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SceneSketch {
    #[serde(default)]
    pub id: u32,
    pub location: String,
    #[serde(default)]
    pub characters: Vec<String>,
    #[serde(default)]
    pub time_of_day: String,
    #[serde(default)]
    pub mood: String,
    #[serde(default)]
    pub action_description: String,
    #[serde(default)]
    pub visual_description: String,
    pub segment: String,
}

const SYSTEM_PROMPT: &str =
    "You are a story analysis engine for an illustration pipeline. Return only valid JSON.";

pub struct StoryAnalyzer {
    client: Arc<dyn GenAiClient>,
}

impl StoryAnalyzer {
    pub fn new(client: Arc<dyn GenAiClient>) -> Self {
        Self { client }
    }

    /// Decomposes the story in a single analysis call. Retries for transient
    /// failures are the client's responsibility; a malformed or inconsistent
    /// breakdown is a hard stop.
    pub async fn analyze(&self, story_text: &str, style_hint: &str) -> Result<StoryBreakdown> {
        let prompt = build_prompt(story_text, style_hint);

        info!("Analyzing story ({} chars)...", story_text.len());
        let response = self.client.generate_text(SYSTEM_PROMPT, &prompt).await?;

        let clean_json = strip_code_blocks(&response);
        let mut breakdown: StoryBreakdown = serde_json::from_str(&clean_json).map_err(|e| {
            PipelineError::AnalysisFailed(format!("unparseable breakdown: {}. Body: {}", e, clean_json))
        })?;

        validate(&breakdown)?;

        // Ids from the model are untrusted; renumber in returned order, which
        // matches the order scenes appear in the source text.
        for (idx, scene) in breakdown.scenes.iter_mut().enumerate() {
            scene.id = idx as u32 + 1;
        }

        info!(
            "Breakdown: {} characters, {} locations, {} scenes",
            breakdown.characters.len(),
            breakdown.locations.len(),
            breakdown.scenes.len()
        );
        Ok(breakdown)
    }
}

fn build_prompt(story_text: &str, style_hint: &str) -> String {
    format!(
        "Analyze the following story for an illustration pipeline.\n\
        \n\
        1. Determine the most appropriate visual art style. Consider tone, genre \
        and setting. Focus on medium, lighting, color palette and mood. \
        User preferences (if any): {style_hint}\n\
        2. Identify the key characters. For each, write a visual portrait: hair, \
        eyes, clothing, body type, age, distinctive features. Visual traits only, \
        no personality.\n\
        3. Identify the main locations with a detailed visual description \
        (architecture, mood, colors, lighting).\n\
        4. Split the text into logical scenes, in the order they appear. A new \
        scene starts on a change of time, location, or major action. Every scene \
        must reference one location and the characters present, using exactly the \
        names from the lists above, and must carry the verbatim text segment it \
        covers.\n\
        \n\
        Return ONLY a JSON object of this shape:\n\
        {{\n\
          \"style\": \"...\",\n\
          \"characters\": [ {{ \"name\": \"...\", \"description\": \"...\" }} ],\n\
          \"locations\": [ {{ \"name\": \"...\", \"description\": \"...\" }} ],\n\
          \"scenes\": [ {{ \"id\": 1, \"location\": \"...\", \"characters\": [\"...\"], \
        \"time_of_day\": \"...\", \"mood\": \"...\", \"action_description\": \"...\", \
        \"visual_description\": \"...\", \"segment\": \"...\" }} ]\n\
        }}\n\
        \n\
        Text:\n{story_text}"
    )
}

/// Cross-reference consistency check. Downstream generation cannot proceed
/// against a breakdown that references entities the analysis did not return.
fn validate(breakdown: &StoryBreakdown) -> Result<()> {
    if breakdown.style.trim().is_empty() {
        return Err(PipelineError::AnalysisFailed("empty style description".to_string()).into());
    }
    if breakdown.scenes.is_empty() {
        return Err(PipelineError::AnalysisFailed("no scenes returned".to_string()).into());
    }

    let characters: HashSet<&str> = breakdown.characters.iter().map(|c| c.name.as_str()).collect();
    let locations: HashSet<&str> = breakdown.locations.iter().map(|l| l.name.as_str()).collect();

    for scene in &breakdown.scenes {
        if !locations.contains(scene.location.as_str()) {
            return Err(PipelineError::AnalysisFailed(format!(
                "scene references unknown location '{}'",
                scene.location
            ))
            .into());
        }
        for name in &scene.characters {
            if !characters.contains(name.as_str()) {
                return Err(PipelineError::AnalysisFailed(format!(
                    "scene references unknown character '{}'",
                    name
                ))
                .into());
            }
        }
        if scene.segment.trim().is_empty() {
            return Err(
                PipelineError::AnalysisFailed("scene with empty text segment".to_string()).into(),
            );
        }
    }

    Ok(())
}

pub fn strip_code_blocks(s: &str) -> String {
    let s = s.trim();
    if s.starts_with("```json") {
        s.trim_start_matches("```json")
            .trim_end_matches("```")
            .trim()
            .to_string()
    } else if s.starts_with("```") {
        s.trim_start_matches("```")
            .trim_end_matches("```")
            .trim()
            .to_string()
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Debug)]
    struct MockClient {
        response: String,
        text_calls: Mutex<usize>,
    }

    impl MockClient {
        fn new(response: &str) -> Arc<Self> {
            Arc::new(Self {
                response: response.to_string(),
                text_calls: Mutex::new(0),
            })
        }
    }

    #[async_trait]
    impl GenAiClient for MockClient {
        async fn generate_text(&self, _system: &str, _user: &str) -> Result<String> {
            *self.text_calls.lock().unwrap() += 1;
            Ok(self.response.clone())
        }

        async fn generate_image(
            &self,
            _prompt: &str,
            _reference_images: &[Vec<u8>],
            _aspect_ratio: &str,
        ) -> Result<Vec<u8>> {
            Err(anyhow!("no image generation in analyzer tests"))
        }
    }

    const VALID_BREAKDOWN: &str = r#"{
        "style": "watercolor, soft light",
        "characters": [
            { "name": "Mara", "description": "red hair, green coat" }
        ],
        "locations": [
            { "name": "Harbor", "description": "fog, wooden piers" }
        ],
        "scenes": [
            { "id": 7, "location": "Harbor", "characters": ["Mara"],
              "time_of_day": "dawn", "mood": "quiet",
              "action_description": "Mara walks the pier",
              "visual_description": "lone figure in fog",
              "segment": "Mara walked out at dawn." }
        ]
    }"#;

    #[tokio::test]
    async fn test_analyze_parses_and_renumbers() {
        let client = MockClient::new(VALID_BREAKDOWN);
        let analyzer = StoryAnalyzer::new(client.clone());

        let breakdown = analyzer.analyze("Mara walked out at dawn.", "").await.unwrap();

        assert_eq!(*client.text_calls.lock().unwrap(), 1);
        assert_eq!(breakdown.scenes.len(), 1);
        // Model said id 7; analyzer renumbers to positional order.
        assert_eq!(breakdown.scenes[0].id, 1);
        assert_eq!(breakdown.scenes[0].location, "Harbor");
    }

    #[tokio::test]
    async fn test_analyze_strips_code_fences() {
        let fenced = format!("```json\n{}\n```", VALID_BREAKDOWN);
        let client = MockClient::new(&fenced);
        let analyzer = StoryAnalyzer::new(client);

        let breakdown = analyzer.analyze("story", "").await.unwrap();
        assert_eq!(breakdown.style, "watercolor, soft light");
    }

    #[tokio::test]
    async fn test_unknown_location_reference_fails_analysis() {
        let json = r#"{
            "style": "noir",
            "characters": [],
            "locations": [],
            "scenes": [
                { "location": "Nowhere", "characters": [], "segment": "text" }
            ]
        }"#;
        let client = MockClient::new(json);
        let analyzer = StoryAnalyzer::new(client);

        let err = analyzer.analyze("story", "").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::AnalysisFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_character_reference_fails_analysis() {
        let json = r#"{
            "style": "noir",
            "characters": [],
            "locations": [ { "name": "Bar", "description": "smoky" } ],
            "scenes": [
                { "location": "Bar", "characters": ["Ghost"], "segment": "text" }
            ]
        }"#;
        let client = MockClient::new(json);
        let analyzer = StoryAnalyzer::new(client);

        let err = analyzer.analyze("story", "").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::AnalysisFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_empty_scene_list_fails_analysis() {
        let json = r#"{ "style": "noir", "characters": [], "locations": [], "scenes": [] }"#;
        let client = MockClient::new(json);
        let analyzer = StoryAnalyzer::new(client);

        let err = analyzer.analyze("story", "").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::AnalysisFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_garbage_response_fails_analysis() {
        let client = MockClient::new("sorry, I cannot help with that");
        let analyzer = StoryAnalyzer::new(client);

        let err = analyzer.analyze("story", "").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::AnalysisFailed(_))
        ));
    }

    #[test]
    fn test_strip_code_blocks() {
        assert_eq!(strip_code_blocks("{}"), "{}");
        assert_eq!(strip_code_blocks("```json\n{}\n```"), "{}");
        assert_eq!(strip_code_blocks("```\n{}\n```"), "{}");
        assert_eq!(strip_code_blocks("  ```json  \n  {}  \n  ```  "), "{}");
    }
}
