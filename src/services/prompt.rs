use crate::core::catalog::{SpeakerRole, Story, StoryCategory};

pub const SEGMENT_STYLE_SUFFIX: &str = "cute cartoon style, colorful and friendly, \
     soft pastel colors, whimsical art style, high quality digital art, no text";

const COVER_BASE_STYLE: &str = "children's book illustration, cute and colorful, soft pastel colors, \
     whimsical art style, friendly and safe for kids ages 3-6, digital art, high quality, detailed";

pub fn role_prefix(role: SpeakerRole) -> &'static str {
    match role {
        SpeakerRole::Protagonist => "A cute little animal protagonist ",
        SpeakerRole::Animal => "Cute animal characters ",
        SpeakerRole::Parent => "A loving parent character ",
        SpeakerRole::Narrator | SpeakerRole::Supporting | SpeakerRole::Other => "",
    }
}

/// Prompt for one segment illustration.
pub fn build_segment_prompt(text: &str, role: SpeakerRole) -> String {
    format!(
        "{}in a children's book illustration showing: {} {}",
        role_prefix(role),
        text,
        SEGMENT_STYLE_SUFFIX
    )
}

fn category_style(category: StoryCategory) -> &'static str {
    match category {
        StoryCategory::Friendship => "happy children playing together, warm atmosphere",
        StoryCategory::Adventure => "exciting journey, magical landscape, discovery",
        StoryCategory::Family => "loving family scene, cozy home, heartwarming",
        StoryCategory::Moral => "kindness and caring, positive message, gentle scene",
        StoryCategory::Fantasy => "magical creatures, enchanted forest, dreamlike",
        StoryCategory::Science => "space or nature exploration, wonder and curiosity",
        StoryCategory::Nature => "beautiful natural landscape, trees and flowers, outdoor scene",
        StoryCategory::DailyLife => "everyday life scene, familiar activities, cozy and friendly",
    }
}

/// Prompt for a story cover. An explicit `cover_prompt` wins; otherwise one is
/// composed from title, protagonist and category.
pub fn build_cover_prompt(story: &Story) -> String {
    if let Some(prompt) = story.cover_prompt.as_deref().filter(|p| !p.trim().is_empty()) {
        return prompt.to_string();
    }

    let protagonist = match story.protagonist.as_deref().map(str::trim) {
        Some(p) if !p.is_empty() => format!("featuring {} as the main character, ", p),
        _ => String::new(),
    };
    let category = category_style(story.category.unwrap_or(StoryCategory::Adventure));

    format!(
        "A beautiful cover illustration for a children's story titled '{}', {}{}, {}, \
         book cover design, centered composition, no text",
        story.title, protagonist, category, COVER_BASE_STYLE
    )
}
