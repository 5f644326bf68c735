//! Translator context menu.
//!
//! The host declares ten placeholder commands whose last character is the
//! slot index. The runtime sends the translators that match the current page
//! with every toolbar update; the slots are filled from that list, and the
//! preferences entry takes the slot right after the last translator (or the
//! tenth slot when there are more translators than fit).

use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{json, Value};

/// Number of translator slots before the preferences entry takes over.
const TRANSLATOR_SLOTS: usize = 9;

/// A translator offered for the current page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Translator {
    pub id: String,
    pub label: String,
}

/// How a placeholder command should be shown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "label", rename_all = "camelCase")]
pub enum MenuSlot {
    Translator(String),
    Preferences(String),
    Hidden,
}

pub struct TranslatorMenu {
    preferences_label: String,
    translators: RwLock<Vec<Translator>>,
}

/// Slot index of a placeholder command, taken from its last character.
pub fn parse_command(command: &str) -> Option<usize> {
    command
        .chars()
        .last()
        .and_then(|c| c.to_digit(10))
        .map(|d| d as usize)
}

impl TranslatorMenu {
    pub fn new(preferences_label: impl Into<String>) -> Self {
        Self {
            preferences_label: preferences_label.into(),
            translators: RwLock::new(Vec::new()),
        }
    }

    pub fn set(&self, translators: Vec<Translator>) {
        *self.translators.write() = translators;
    }

    pub fn translators(&self) -> Vec<Translator> {
        self.translators.read().clone()
    }

    fn is_preferences(index: usize, count: usize) -> bool {
        index == count || (count > TRANSLATOR_SLOTS && index == TRANSLATOR_SLOTS)
    }

    pub fn slot(&self, index: usize) -> MenuSlot {
        let translators = self.translators.read();
        let count = translators.len();

        if index < count && index < TRANSLATOR_SLOTS {
            MenuSlot::Translator(translators[index].label.clone())
        } else if index == count || count > TRANSLATOR_SLOTS {
            MenuSlot::Preferences(self.preferences_label.clone())
        } else {
            MenuSlot::Hidden
        }
    }

    /// Arguments sent to the runtime when slot `index` is picked.
    pub fn selection(&self, index: usize) -> Option<Value> {
        let translators = self.translators.read();
        let count = translators.len();

        if Self::is_preferences(index, count) {
            Some(json!(["prefs"]))
        } else {
            translators
                .get(index)
                .map(|translator| Value::String(translator.id.clone()))
        }
    }
}
