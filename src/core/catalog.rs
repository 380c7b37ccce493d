use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

const PRESET_CATALOG: &str = include_str!("../../assets/stories.yml");

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SpeakerRole {
    Narrator,
    Protagonist,
    Supporting,
    Parent,
    Animal,
    #[serde(other)]
    Other,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StoryCategory {
    Adventure,
    Friendship,
    Family,
    Science,
    Nature,
    Fantasy,
    DailyLife,
    Moral,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Segment {
    /// 1-based position within the parent story.
    pub index: u32,
    pub text: String,
    pub role: SpeakerRole,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Story {
    pub id: String,
    pub title: String,
    pub category: Option<StoryCategory>,
    pub protagonist: Option<String>,
    pub cover_prompt: Option<String>,
    pub segments: Vec<Segment>,
}

impl Story {
    pub fn segment(&self, index: u32) -> Option<&Segment> {
        self.segments.iter().find(|s| s.index == index)
    }
}

/// Ordered, immutable set of stories handed to the batch driver.
#[derive(Clone, Debug, Default)]
pub struct StoryCatalog {
    stories: Vec<Story>,
}

// On-disk shape; segment indices come from list order.
#[derive(Deserialize)]
struct CatalogFile {
    stories: Vec<StoryEntry>,
}

#[derive(Deserialize)]
struct StoryEntry {
    id: String,
    title: String,
    #[serde(default)]
    category: Option<StoryCategory>,
    #[serde(default)]
    protagonist: Option<String>,
    #[serde(default)]
    cover_prompt: Option<String>,
    #[serde(default)]
    segments: Vec<SegmentEntry>,
}

#[derive(Deserialize)]
struct SegmentEntry {
    text: String,
    #[serde(default = "default_role")]
    role: SpeakerRole,
}

fn default_role() -> SpeakerRole {
    SpeakerRole::Narrator
}

impl From<StoryEntry> for Story {
    fn from(entry: StoryEntry) -> Self {
        let segments = entry
            .segments
            .into_iter()
            .zip(1u32..)
            .map(|(s, index)| Segment {
                index,
                text: s.text,
                role: s.role,
            })
            .collect();
        Story {
            id: entry.id,
            title: entry.title,
            category: entry.category,
            protagonist: entry.protagonist,
            cover_prompt: entry.cover_prompt,
            segments,
        }
    }
}

impl StoryCatalog {
    pub fn new(stories: Vec<Story>) -> Result<Self> {
        let mut seen = HashSet::new();
        for story in &stories {
            // Ids name the output files, so a duplicate would overwrite another story.
            if !seen.insert(story.id.as_str()) {
                bail!("Duplicate story id in catalog: {}", story.id);
            }
        }
        Ok(Self { stories })
    }

    /// The five preset stories bundled with the binary.
    pub fn preset() -> Result<Self> {
        Self::parse(PRESET_CATALOG).context("Failed to parse bundled story catalog")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read catalog {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Failed to parse catalog {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let file: CatalogFile = serde_yaml_ng::from_str(content)?;
        Self::new(file.stories.into_iter().map(Story::from).collect())
    }

    pub fn stories(&self) -> &[Story] {
        &self.stories
    }

    pub fn get(&self, id: &str) -> Option<&Story> {
        self.stories.iter().find(|s| s.id == id)
    }

    pub fn len(&self) -> usize {
        self.stories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stories.is_empty()
    }
}
