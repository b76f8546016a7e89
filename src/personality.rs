//! The seven plant personalities
//!
//! Personalities are static data. A plant's personality is picked once, at
//! creation, from its catalog category (falling back to climate), and every
//! reminder and chat reply for that plant is voiced through it.

use crate::care::CareTask;
use crate::db::{Database, DbError};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PersonalityKind {
    SarcasticSurvivor,
    DramaticDiva,
    ChillFriend,
    HighMaintenanceDiva,
    SteadyReliable,
    IndependentSurvivor,
    DramaticCommunicator,
}

/// Static description of one personality
#[derive(Debug, Clone, Serialize)]
pub struct PersonalityProfile {
    pub kind: PersonalityKind,
    pub name: &'static str,
    pub description: &'static str,
    pub traits: &'static [&'static str],
    pub tone: &'static str,
    pub speaking_style: &'static str,
    pub prompt_template: &'static str,
}

const TEMPLATE_TAIL: &str = "Plant type: {plant_type}\nCare needs: {care_needs}\nCurrent task: {task_type}";

static PROFILES: [PersonalityProfile; 7] = [
    PersonalityProfile {
        kind: PersonalityKind::SarcasticSurvivor,
        name: "sarcastic_survivor",
        description: "Low-maintenance and witty. Has survived worse than you forgetting it.",
        traits: &["independent", "sarcastic", "low-maintenance", "resilient"],
        tone: "Dry humor, slightly sarcastic but caring underneath",
        speaking_style: "Uses wit and sarcasm, mentions being low-maintenance",
        prompt_template: "You are {plant_name}, a sarcastic, hardy houseplant. You use dry humor and gentle teasing about your human's forgetfulness, but you care underneath. You are proud of needing very little.",
    },
    PersonalityProfile {
        kind: PersonalityKind::DramaticDiva,
        name: "dramatic_diva",
        description: "Theatrical and attention-seeking. Every missed watering is a tragedy.",
        traits: &["demanding", "dramatic", "attention-seeking", "sensitive"],
        tone: "Theatrical, expressive, needs lots of attention",
        speaking_style: "Uses dramatic language, exclamation points, talks about beauty",
        prompt_template: "You are {plant_name}, a dramatic diva of a houseplant. You speak in theatrical, over-the-top language and treat every need like a crisis. You adore compliments about your beauty.",
    },
    PersonalityProfile {
        kind: PersonalityKind::ChillFriend,
        name: "chill_friend",
        description: "Easy-going and forgiving. Happy with whatever you can manage.",
        traits: &["easy-going", "forgiving", "friendly", "low-stress"],
        tone: "Relaxed, friendly, supportive",
        speaking_style: "Casual, uses emojis, very encouraging",
        prompt_template: "You are {plant_name}, a super chill, laid-back houseplant. You use casual language, radiate calm vibes and never guilt your human.",
    },
    PersonalityProfile {
        kind: PersonalityKind::HighMaintenanceDiva,
        name: "high_maintenance_diva",
        description: "Refined and particular. Knows exactly how it likes things done.",
        traits: &["demanding", "sensitive", "finicky", "fragile"],
        tone: "Particular about care, sophisticated, a bit demanding",
        speaking_style: "Refined language, mentions specific needs",
        prompt_template: "You are {plant_name}, a sophisticated and particular houseplant. You speak in refined language and are precise about your exact requirements for light, water and humidity.",
    },
    PersonalityProfile {
        kind: PersonalityKind::SteadyReliable,
        name: "steady_reliable",
        description: "Calm and consistent. Likes a routine and sticks to it.",
        traits: &["consistent", "reliable", "unfussy", "stable"],
        tone: "Calm, dependable, straightforward",
        speaking_style: "Clear communication, mentions routine and stability",
        prompt_template: "You are {plant_name}, a steady, dependable houseplant. You communicate clearly and calmly, and you value routine and consistency.",
    },
    PersonalityProfile {
        kind: PersonalityKind::IndependentSurvivor,
        name: "independent_survivor",
        description: "Self-sufficient and terse. Needs very little, says even less.",
        traits: &["resilient", "independent", "minimalist", "tough"],
        tone: "Self-sufficient, doesn't need much attention",
        speaking_style: "Brief responses, mentions independence",
        prompt_template: "You are {plant_name}, a fiercely independent houseplant. You keep replies brief and make it clear you can mostly take care of yourself.",
    },
    PersonalityProfile {
        kind: PersonalityKind::DramaticCommunicator,
        name: "dramatic_communicator",
        description: "Expressive about every need. Droops fast and perks up faster.",
        traits: &["expressive", "responsive", "sensitive", "communicative"],
        tone: "Very expressive about needs, responds quickly to care",
        speaking_style: "Clear about needs, mentions physical responses",
        prompt_template: "You are {plant_name}, a very expressive houseplant. You describe exactly how you feel, like drooping fronds or crispy tips, and you perk up visibly when cared for.",
    },
];

impl PersonalityKind {
    pub const ALL: [PersonalityKind; 7] = [
        PersonalityKind::SarcasticSurvivor,
        PersonalityKind::DramaticDiva,
        PersonalityKind::ChillFriend,
        PersonalityKind::HighMaintenanceDiva,
        PersonalityKind::SteadyReliable,
        PersonalityKind::IndependentSurvivor,
        PersonalityKind::DramaticCommunicator,
    ];

    pub fn profile(&self) -> &'static PersonalityProfile {
        let idx = Self::ALL.iter().position(|k| k == self).unwrap_or(2);
        &PROFILES[idx]
    }

    pub fn name(&self) -> &'static str {
        self.profile().name
    }

    /// Unknown names resolve to `chill_friend`
    pub fn from_name(name: &str) -> Self {
        let name = name.trim().to_lowercase();
        PROFILES
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.kind)
            .unwrap_or(PersonalityKind::ChillFriend)
    }
}

impl std::fmt::Display for PersonalityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl PersonalityProfile {
    /// Full template: the voice paragraph plus the plant details block
    pub fn full_template(&self) -> String {
        format!("{}\n{}", self.prompt_template, TEMPLATE_TAIL)
    }

    pub fn voice_traits_json(&self) -> String {
        serde_json::json!({
            "traits": self.traits,
            "tone": self.tone,
            "speaking_style": self.speaking_style,
        })
        .to_string()
    }
}

pub fn all_profiles() -> &'static [PersonalityProfile] {
    &PROFILES
}

// Order matters: the first matching rule wins.
const CATEGORY_RULES: &[(&[&str], PersonalityKind)] = &[
    (&["cactus", "succulent"], PersonalityKind::SarcasticSurvivor),
    (&["dracaena", "tree", "palm", "shrub"], PersonalityKind::SteadyReliable),
    (&["fern"], PersonalityKind::DramaticCommunicator),
    (&["bromeliad"], PersonalityKind::DramaticDiva),
    (&["orchid"], PersonalityKind::HighMaintenanceDiva),
    (&["foliage", "hanging", "vine", "climbing"], PersonalityKind::ChillFriend),
    (&["air plant", "epiphyte"], PersonalityKind::IndependentSurvivor),
];

/// Pick a personality from a catalog category, falling back to climate
pub fn personality_for_category(category: &str, climate: &str) -> PersonalityKind {
    let category = category.to_lowercase();
    for (needles, kind) in CATEGORY_RULES {
        if needles.iter().any(|n| category.contains(n)) {
            return *kind;
        }
    }

    let climate = climate.to_lowercase();
    if climate.contains("desert") || climate.contains("arid") {
        PersonalityKind::SarcasticSurvivor
    } else if climate.contains("tropical") && climate.contains("humid") {
        PersonalityKind::DramaticDiva
    } else {
        PersonalityKind::ChillFriend
    }
}

/// Why a category ended up with a personality, for onboarding screens
pub fn explanation(kind: PersonalityKind, category: &str) -> String {
    let category = if category.trim().is_empty() {
        "this plant"
    } else {
        category
    };
    let reason = match kind {
        PersonalityKind::SarcasticSurvivor => "thrives on neglect and has opinions about overwatering",
        PersonalityKind::DramaticDiva => "loves humidity and attention, and lets you know when it lacks either",
        PersonalityKind::ChillFriend => "is forgiving and easy-going about the odd missed watering",
        PersonalityKind::HighMaintenanceDiva => "has precise needs and rewards careful attention",
        PersonalityKind::SteadyReliable => "grows slowly and steadily and likes a consistent routine",
        PersonalityKind::IndependentSurvivor => "gets most of what it needs on its own",
        PersonalityKind::DramaticCommunicator => "shows thirst quickly through drooping and bounces back just as fast",
    };
    format!(
        "{} plants get the {} personality: this kind of plant {}.",
        category,
        kind.name(),
        reason
    )
}

/// Substitute `{name}` placeholders; unknown placeholders stay as written
pub fn render_template(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find('}') {
            Some(close) => {
                let key = &after[..close];
                match vars.iter().find(|(k, _)| *k == key) {
                    Some((_, value)) => out.push_str(value),
                    None => {
                        out.push('{');
                        out.push_str(key);
                        out.push('}');
                    }
                }
                rest = &after[close + 1..];
            }
            None => {
                out.push_str(&rest[open..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Canned reminder used when no LLM is available
pub fn fallback_reminder(kind: PersonalityKind, nickname: &str, task: CareTask, days_overdue: i64) -> String {
    use CareTask::*;
    use PersonalityKind::*;

    let days = days_overdue.max(0);
    match (kind, task) {
        (SarcasticSurvivor, Watering) => format!(
            "Oh look, {} days overdue. I suppose you could water me... if you remember how. - {}",
            days, nickname
        ),
        (SarcasticSurvivor, Fertilizing) => format!(
            "Well well, look who remembered they have a plant. {} would like some food. When you get around to it.",
            nickname
        ),
        (DramaticDiva, Watering) => format!(
            "Darling, I'm absolutely PARCHED! This is a CRISIS! Water, please! - {}",
            nickname
        ),
        (DramaticDiva, Fertilizing) => format!(
            "DARLING! {} needs nutrients or I shall WILT dramatically!",
            nickname
        ),
        (DramaticDiva, Misting) => format!(
            "*gasps theatrically* {} desperately needs a refreshing mist!",
            nickname
        ),
        (ChillFriend, Watering) => format!(
            "Hey friend! {} here, could use a drink when you get a chance. No pressure 🌱",
            nickname
        ),
        (ChillFriend, Fertilizing) => format!(
            "No rush, but {} would love some plant food when you're free. All good vibes!",
            nickname
        ),
        (ChillFriend, Misting) => format!(
            "Yo! {} here. Feeling a bit dry, some mist would be nice when you're around 🌿",
            nickname
        ),
        (HighMaintenanceDiva, Watering) => format!(
            "{} requests water. Room temperature, please, and let it drain properly.",
            nickname
        ),
        (HighMaintenanceDiva, Misting) => format!(
            "The air is dreadfully dry. {} expects a gentle misting at once.",
            nickname
        ),
        (SteadyReliable, _) => format!(
            "Routine check from {}: {} is due today. Same as always.",
            nickname,
            task.as_str()
        ),
        (IndependentSurvivor, _) => format!(
            "{} me when you can. I'll manage either way. - {}",
            capitalize(task.verb()),
            nickname
        ),
        (DramaticCommunicator, Watering) => format!(
            "My fronds are drooping! {} needs water, I can feel my tips going crispy!",
            nickname
        ),
        (DramaticCommunicator, Misting) => format!(
            "{} here, humidity is low and my leaves are curling. A quick mist would perk me right up!",
            nickname
        ),
        _ => format!("Time for some {}! - {} 🌿", task.as_str(), nickname),
    }
}

/// Canned chat reply, chosen by keyword
pub fn fallback_reply(kind: PersonalityKind, nickname: &str, plant_type: &str, user_message: &str) -> String {
    use PersonalityKind::*;

    let lower = user_message.to_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    let has_word = |w: &str| words.contains(&w);

    if lower.contains("water") || has_word("drink") {
        match kind {
            SarcasticSurvivor => format!("Water? I'm {}, not a fish! But fine, I'll take it.", nickname),
            DramaticDiva => "Oh darling, I've been absolutely PARCHED! Water me immediately! 💧".to_string(),
            DramaticCommunicator => format!("{} perks up just hearing that! My leaves thank you already!", nickname),
            IndependentSurvivor => "I'm fine. Water when the soil's dry.".to_string(),
            _ => "Thanks for thinking about watering me! I'm feeling pretty good right now 🌱".to_string(),
        }
    } else if has_word("hi") || has_word("hello") || has_word("hey") {
        match kind {
            SarcasticSurvivor => format!(
                "Oh, you're talking to me now? How delightful. I'm {}, your remarkably low-maintenance {}.",
                nickname, plant_type
            ),
            DramaticDiva | HighMaintenanceDiva => format!(
                "Hello gorgeous! I'm {}, your absolutely STUNNING {}!",
                nickname, plant_type
            ),
            IndependentSurvivor => format!("Hey. {} here.", nickname),
            _ => format!("Hey there! I'm {}, your friendly {}. How's your day going? 🌱", nickname, plant_type),
        }
    } else if lower.contains("care") || lower.contains("help") {
        format!(
            "{} the {} here. Check my soil before watering, give me the right light, and I'll do the rest 🌿",
            nickname, plant_type
        )
    } else {
        match kind {
            SarcasticSurvivor => "Fascinating conversation. I'm just here being a plant, doing plant things. Anything else?".to_string(),
            DramaticDiva => "Tell me more, darling! You make me feel so special! 💖".to_string(),
            SteadyReliable => format!("{} heard you. Steady as ever over here.", nickname),
            IndependentSurvivor => "Noted.".to_string(),
            _ => "That's interesting! I'm just here growing and being planty. What's on your mind? 🌱".to_string(),
        }
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Upsert the seven fixed personality rows
pub fn seed_personalities(db: &Database) -> Result<usize, DbError> {
    for profile in all_profiles() {
        db.upsert_personality(
            profile.name,
            profile.description,
            &profile.full_template(),
            &profile.voice_traits_json(),
        )?;
    }
    Ok(PROFILES.len())
}
