//! Key/value application settings

use super::Database;
use crate::config::ReconSettings;
use crate::WatchResult;
use chrono::Utc;
use rusqlite::{params, OptionalExtension};

/// app_config key holding the recon service connection settings
pub const RECON_SETTINGS_KEY: &str = "recon";

impl Database {
    pub fn get_setting(&self, key: &str) -> WatchResult<Option<String>> {
        let conn = self.lock()?;
        let value = conn
            .query_row("SELECT value FROM app_config WHERE key = ?1", params![key], |row| row.get(0))
            .optional()?;
        Ok(value)
    }

    pub fn set_setting(&self, key: &str, value: &str) -> WatchResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO app_config (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, Utc::now()],
        )?;
        Ok(())
    }

    /// Stored recon settings; `None` means the service was never configured
    pub fn recon_settings(&self) -> WatchResult<Option<ReconSettings>> {
        match self.get_setting(RECON_SETTINGS_KEY)? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    pub fn save_recon_settings(&self, settings: &ReconSettings) -> WatchResult<()> {
        self.set_setting(RECON_SETTINGS_KEY, &serde_json::to_string(settings)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProbeMode;

    #[test]
    fn test_recon_settings_absent_then_saved() {
        let db = Database::in_memory().unwrap();
        assert!(db.recon_settings().unwrap().is_none());

        let settings = ReconSettings { probe_mode: ProbeMode::Passive, ..Default::default() };
        db.save_recon_settings(&settings).unwrap();
        assert_eq!(db.recon_settings().unwrap(), Some(settings.clone()));

        let updated = ReconSettings { probe_throttle: 9, ..settings };
        db.save_recon_settings(&updated).unwrap();
        assert_eq!(db.recon_settings().unwrap().unwrap().probe_throttle, 9);
    }
}
