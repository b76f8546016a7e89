//! Phone verification
//!
//! A user's first plant introduces itself with a welcome text that asks for
//! a reply. The first inbound message from an unverified number verifies it
//! and is answered with the PlantTexts contact card. Scheduled reminders only
//! go to verified numbers.

use crate::db::{Database, PlantDetails};
use crate::personality::PersonalityKind;
use crate::sms::{self, SmsError, SmsReceipt, SmsSender};
use serde::Serialize;
use tracing::{debug, info};

pub const CONTACT_CARD: &str = "PlantTexts - your plant care companion\n\
Save this number so your plants' texts don't get lost.\n\
Reply HELP for commands or STOP to unsubscribe.\n\
Happy growing!";

pub const VERIFIED_TEXT: &str =
    "Phone verified! You'll now get care reminders from your plants.";

/// Why no welcome text went out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WelcomeSkipped {
    AlreadyVerified,
    NotFirstPlant,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "welcome", rename_all = "snake_case")]
pub enum WelcomeOutcome {
    Sent { message: String, receipt: SmsReceipt },
    Skipped { reason: WelcomeSkipped },
}

impl WelcomeOutcome {
    pub fn is_sent(&self) -> bool {
        matches!(self, WelcomeOutcome::Sent { .. })
    }
}

/// The first plant's introduction, in its own voice
pub fn welcome_message(kind: PersonalityKind, nickname: &str) -> String {
    let intro = match kind {
        PersonalityKind::SarcasticSurvivor => format!(
            "Hey. I'm {}. I'll text you when I need water, which is less often than you'd think.",
            nickname
        ),
        PersonalityKind::DramaticDiva => format!(
            "Darling! I'm {} and I am SO thrilled to be your plant. Expect fabulous reminders.",
            nickname
        ),
        PersonalityKind::ChillFriend => format!(
            "Hey, I'm {}. Pretty easygoing, but I'll ping you when I need a little care.",
            nickname
        ),
        PersonalityKind::HighMaintenanceDiva => format!(
            "Hello, I'm {}. I have very specific needs, and I'll walk you through every one.",
            nickname
        ),
        PersonalityKind::SteadyReliable => format!(
            "Greetings, I'm {}. We'll grow steadily together, one season at a time.",
            nickname
        ),
        PersonalityKind::IndependentSurvivor => format!(
            "I'm {}. I mostly handle myself, but I'll let you know when I could use a hand.",
            nickname
        ),
        PersonalityKind::DramaticCommunicator => format!(
            "Hi hi! I'm {}! I'll tell you EXACTLY how I'm feeling, and when I need you.",
            nickname
        ),
    };
    format!("{}\n\nReply YES to confirm this number and start getting care reminders.", intro)
}

/// What an unverified number gets back on its first message
pub fn verified_reply() -> String {
    format!("{}\n\n{}", VERIFIED_TEXT, CONTACT_CARD)
}

/// Send the welcome text if `user_id` is unverified and has exactly one
/// active plant
pub fn send_welcome(db: &Database, sender: &dyn SmsSender, user_id: i32) -> Result<WelcomeOutcome, SmsError> {
    let user = db.get_user(user_id)?;
    if user.phone_verified {
        debug!(user_id, "phone already verified, no welcome");
        return Ok(WelcomeOutcome::Skipped { reason: WelcomeSkipped::AlreadyVerified });
    }

    let plants = db.list_plant_details(user_id)?;
    let first: &PlantDetails = match plants.as_slice() {
        [only] => only,
        _ => return Ok(WelcomeOutcome::Skipped { reason: WelcomeSkipped::NotFirstPlant }),
    };

    let kind = PersonalityKind::from_name(&first.personality.name);
    let message = welcome_message(kind, &first.plant.nickname);
    let receipt = sender.send(&user.phone, &message)?;
    sms::record_outbound(db, &user.phone, &message, &receipt)?;
    info!(user_id, plant_id = first.plant.id, provider = %receipt.provider, "welcome text sent");

    Ok(WelcomeOutcome::Sent { message, receipt })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::{catalog_id, seeded_db};
    use crate::db::UserSignup;
    use crate::sms::LogSender;

    #[test]
    fn test_welcome_on_first_plant_only() {
        let (_dir, db) = seeded_db();
        let sender = LogSender::new(db.clone());
        let user = db.create_user(&UserSignup::with_phone("+15551234567")).unwrap();

        let outcome = send_welcome(&db, &sender, user.id).unwrap();
        assert!(matches!(outcome, WelcomeOutcome::Skipped { reason: WelcomeSkipped::NotFirstPlant }));

        db.add_user_plant(user.id, catalog_id(&db, "Aloe vera"), "Spike").unwrap();
        let outcome = send_welcome(&db, &sender, user.id).unwrap();
        match &outcome {
            WelcomeOutcome::Sent { message, receipt } => {
                assert!(message.contains("Spike"));
                assert!(message.contains("Reply YES"));
                assert_eq!(receipt.provider, "log");
            }
            other => panic!("expected a welcome, got {:?}", other),
        }
        let logged = db.recent_sms(5).unwrap();
        assert_eq!(logged.len(), 1);
        assert_eq!(logged[0].phone, "+15551234567");

        db.add_user_plant(user.id, catalog_id(&db, "Nephrolepis exaltata"), "Fernanda").unwrap();
        let outcome = send_welcome(&db, &sender, user.id).unwrap();
        assert!(!outcome.is_sent());
    }

    #[test]
    fn test_no_welcome_once_verified() {
        let (_dir, db) = seeded_db();
        let sender = LogSender::new(db.clone());
        let user = db.create_user(&UserSignup::with_phone("+15551234567")).unwrap();
        db.add_user_plant(user.id, catalog_id(&db, "Aloe vera"), "Spike").unwrap();
        db.mark_phone_verified(user.id).unwrap();

        let outcome = send_welcome(&db, &sender, user.id).unwrap();
        assert!(matches!(outcome, WelcomeOutcome::Skipped { reason: WelcomeSkipped::AlreadyVerified }));
        assert!(db.recent_sms(5).unwrap().is_empty());
    }

    #[test]
    fn test_every_personality_asks_for_a_reply() {
        for kind in PersonalityKind::ALL {
            let text = welcome_message(kind, "Sprout");
            assert!(text.contains("Sprout"), "{:?}", kind);
            assert!(text.ends_with("start getting care reminders."));
        }
        assert!(verified_reply().contains("STOP"));
    }
}
