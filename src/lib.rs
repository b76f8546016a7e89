//! planttexts - houseplant care reminders over two-way SMS
//!
//! Every plant a user owns gets one of seven fixed personalities, picked
//! from its catalog category. Reminders and chat replies are written in
//! that voice by an LLM, with canned per-personality text whenever the LLM
//! is unavailable.
//!
//! # Pieces
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `catalog` | Species catalog and its seeding from a JSON dataset |
//! | `personality` | The seven personalities and category assignment |
//! | `care` | Care tasks, due dates and urgency |
//! | `db` | SQLite store (diesel + r2d2) |
//! | `chat` | Reminder and reply generation |
//! | `sms` | Phone numbers, reply parsing, senders, inbound handling |
//! | `onboarding` | Welcome text and phone verification |
//! | `reminders` | Scheduled reminder worker with retry |
//! | `serve` | HTTP API and SMS webhook |
//!
//! # Quick Start
//!
//! ```no_run
//! use planttexts::{catalog, personality, Database, UserSignup};
//!
//! let db = Database::open_at("planttexts.db").unwrap();
//! personality::seed_personalities(&db).unwrap();
//! catalog::seed_catalog(&db, catalog::BUNDLED_SOURCE, catalog::bundled_seed()).unwrap();
//!
//! let user = db.create_user(&UserSignup::with_phone("+15551234567")).unwrap();
//! let aloe = db.list_catalog(Some("aloe"), 1).unwrap().remove(0);
//! let (plant, _) = db.add_user_plant(user.id, aloe.id, "Spike").unwrap();
//!
//! for schedule in db.list_schedules_for_plant(plant.id).unwrap() {
//!     println!("{} due {}", schedule.task_type, schedule.next_due);
//! }
//! ```

pub mod care;
pub mod catalog;
pub mod chat;
pub mod config;
pub mod db;
pub mod llm;
pub mod onboarding;
pub mod personality;
pub mod reminders;
pub mod schema;
pub mod serve;
pub mod sms;

pub use care::{CareTask, Urgency};
pub use chat::{ChatService, GeneratedMessage, MessageSource};
pub use config::Config;
pub use db::{
    CareEvent, CareSchedule, CatalogEntry, Database, DbError, PlantDetails, User, UserPlant, UserSignup,
    CURRENT_SCHEMA,
};
pub use personality::PersonalityKind;
pub use sms::{InboundProcessor, SmsIntent, SmsSender};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_exports() {
        let _ = CURRENT_SCHEMA;
        assert_eq!(PersonalityKind::ALL.len(), 7);
        assert_eq!(CareTask::ALL.len(), 5);
    }
}
