//! Orchestrates udev events against the persistent rule databases.
//!
//! The manager owns the global database (and the signed-in user's database
//! when one is available), applies the mode-switch trash window, runs
//! garbage collection, and assembles the rules file handed to the policy
//! daemon.

use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use tracing::warn;

use crate::error::{Error, Result};
use crate::fingerprint::{fingerprint, fingerprint_rules};
use crate::rule::validate_rule;
use crate::store::{remove_entries_older_than, EntryMap, RuleStore, Timestamp};

/// Global database directory, relative to the root prefix.
pub const DEFAULT_GLOBAL_DIR: &str = "run/usb_bouncer";

/// Parent of the per-user database directories, relative to the root prefix.
pub const USER_DB_PARENT_DIR: &str = "run/daemon-store/usb_bouncer";

/// Drop-in rules directory, relative to the root prefix.
pub const POLICY_DIR: &str = "etc/usbguard/rules.d";

/// How long a removed entry survives in trash so a mode-switching device can
/// reclaim its previous personalities.
const MODE_SWITCH_WINDOW: Duration = Duration::from_millis(1000);

/// Age past which user-database entries are collected (one quarter, 365/4
/// days with integer division).
const CLEANUP_WINDOW: Duration = Duration::from_secs((365 / 4) * 24 * 60 * 60);

/// Maps a udev devpath to a policy rule. Production wires this to the sysfs
/// device inspector; tests inject fixed rules.
pub type DevpathToRule = Box<dyn Fn(&str) -> String>;

/// A udev event kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UdevAction {
    Add,
    Remove,
}

pub struct EntryManager {
    root_dir: PathBuf,
    global: RuleStore,
    user: Option<RuleStore>,
    rule_from_devpath: DevpathToRule,
}

impl EntryManager {
    /// Opens the global database under `root_dir` and, when `user_db_dir` is
    /// given, the user database inside it.
    pub fn new(
        root_dir: impl Into<PathBuf>,
        user_db_dir: Option<PathBuf>,
        rule_from_devpath: DevpathToRule,
    ) -> Result<Self> {
        let root_dir = root_dir.into();
        let global = RuleStore::open(&root_dir.join(DEFAULT_GLOBAL_DIR))?;
        let user = match user_db_dir {
            Some(dir) => Some(RuleStore::open(&dir)?),
            None => None,
        };
        Ok(Self {
            root_dir,
            global,
            user,
            rule_from_devpath,
        })
    }

    /// Handles a udev add/remove event for `devpath`.
    pub fn handle_event(&mut self, action: UdevAction, devpath: &str) -> Result<()> {
        self.validate_devpath(devpath)?;
        let key = fingerprint(devpath);

        match action {
            UdevAction::Add => {
                let rule = (self.rule_from_devpath)(devpath);
                if !validate_rule(&rule) {
                    return Err(Error::BadRule(rule));
                }

                let refreshed = {
                    let entry = self.global.get_mut().entries.entry(key.clone()).or_default();
                    entry.last_used = Timestamp::now();
                    !entry.rules.is_empty()
                };
                // An already-connected device re-announcing itself only
                // refreshes the timestamp.
                if refreshed {
                    return self.persist_changes();
                }

                // Reclaim modes this device presented just before the
                // remove, skipping one identical to the new rule.
                let db = self.global.get_mut();
                remove_entries_older_than(MODE_SWITCH_WINDOW, &mut db.trash);
                let mut rules = Vec::new();
                if let Some(previous) = db.trash.remove(&key) {
                    for mode in previous.rules {
                        if mode != rule {
                            rules.push(mode);
                        }
                    }
                }
                rules.push(rule);

                let entry = db.entries.entry(key).or_default();
                entry.rules = rules;
                let snapshot = entry.clone();

                if let Some(user) = &mut self.user {
                    user.get_mut()
                        .entries
                        .insert(fingerprint_rules(&snapshot.rules), snapshot);
                }
                self.persist_changes()
            }
            UdevAction::Remove => {
                // The user database deliberately keeps its entry: it records
                // devices the user has trusted at some point, and unplugging
                // does not revoke that trust.
                let db = self.global.get_mut();
                if let Some(mut entry) = db.entries.remove(&key) {
                    entry.last_used = Timestamp::now();
                    db.trash.insert(key, entry);
                    return self.persist_changes();
                }
                Ok(())
            }
        }
    }

    /// Collects expired trash and stale user-database entries. The live
    /// global allow-list is never touched.
    pub fn garbage_collect(&mut self) -> Result<()> {
        if self.garbage_collect_internal(false) == 0 {
            return Ok(());
        }
        self.persist_changes()
    }

    /// Assembles the rules file: trusted rules first (so later block rules
    /// cannot shadow them), then every `.conf` drop-in in sorted order.
    pub fn generate_rules(&self) -> Result<String> {
        let mut result = String::new();

        let source = match &self.user {
            Some(user) => &user.get().entries,
            None => &self.global.get().entries,
        };
        for rule in unique_rules(source) {
            result.push_str(&rule);
            result.push('\n');
        }

        let policy_dir = self.root_dir.join(POLICY_DIR);
        let mut conf_files = Vec::new();
        if let Ok(dir) = std::fs::read_dir(&policy_dir) {
            for dir_entry in dir.flatten() {
                let path = dir_entry.path();
                let is_conf = path
                    .extension()
                    .map(|ext| ext.eq_ignore_ascii_case("conf"))
                    .unwrap_or(false);
                if path.is_file() && is_conf {
                    conf_files.push(path);
                }
            }
        }
        conf_files.sort();

        for conf in conf_files {
            match std::fs::read_to_string(&conf) {
                Ok(contents) => {
                    result.push_str(&contents);
                    if !contents.ends_with('\n') {
                        result.push('\n');
                    }
                }
                Err(e) => warn!(path = %conf.display(), error = %e, "skipping unreadable drop-in"),
            }
        }
        Ok(result)
    }

    /// Copies every populated global entry into the user database, keyed by
    /// the fingerprint of its rule list.
    pub fn handle_user_login(&mut self) -> Result<()> {
        let global_entries = self.global.get().entries.clone();
        let user = self.user.as_mut().ok_or(Error::NoUserDb)?;
        for entry in global_entries.into_values() {
            if entry.rules.is_empty() {
                continue;
            }
            user.get_mut()
                .entries
                .insert(fingerprint_rules(&entry.rules), entry);
        }
        self.persist_changes()
    }

    pub fn global_store(&self) -> &RuleStore {
        &self.global
    }

    pub fn global_store_mut(&mut self) -> &mut RuleStore {
        &mut self.global
    }

    pub fn user_store(&self) -> Option<&RuleStore> {
        self.user.as_ref()
    }

    fn garbage_collect_internal(&mut self, global_only: bool) -> usize {
        let mut removed =
            remove_entries_older_than(MODE_SWITCH_WINDOW, &mut self.global.get_mut().trash);

        if !global_only {
            match &mut self.user {
                Some(user) => {
                    removed +=
                        remove_entries_older_than(CLEANUP_WINDOW, &mut user.get_mut().entries);
                }
                None => warn!("no user database; skipping user cleanup"),
            }
        }
        removed
    }

    fn validate_devpath(&self, devpath: &str) -> Result<()> {
        if devpath.is_empty() {
            return Err(Error::BadDevpath(devpath.to_string()));
        }

        let normalized = self
            .root_dir
            .join("sys")
            .join(devpath.trim_start_matches('/'));
        if normalized
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(Error::BadDevpath(devpath.to_string()));
        }

        let devpath_root = self.root_dir.join("sys/devices");
        if !normalized.starts_with(&devpath_root) || normalized == devpath_root {
            return Err(Error::BadDevpath(devpath.to_string()));
        }
        Ok(())
    }

    fn persist_changes(&mut self) -> Result<()> {
        self.global.persist()?;
        if let Some(user) = &mut self.user {
            user.persist()?;
        }
        Ok(())
    }
}

/// Deduplicated, deterministically ordered rule strings from `entries`.
fn unique_rules(entries: &EntryMap) -> BTreeSet<String> {
    let mut rules = BTreeSet::new();
    for entry in entries.values() {
        for rule in &entry.rules {
            if !rule.is_empty() {
                rules.insert(rule.clone());
            }
        }
    }
    rules
}

/// Picks the primary user's database directory: the first entry (sorted)
/// under the daemon-store parent, or None when no user has logged in.
pub fn find_user_db_dir(root_dir: &Path) -> Option<PathBuf> {
    let parent = root_dir.join(USER_DB_PARENT_DIR);
    let mut dirs: Vec<PathBuf> = std::fs::read_dir(parent)
        .ok()?
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    dirs.sort();
    dirs.into_iter().next()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::RuleEntry;
    use tempfile::TempDir;

    const DEVPATH: &str = "/devices/pci0000:00/0000:00:14.0/usb1/1-1";
    const RULE_STORAGE: &str = "allow id 0781:5588 hash \"X\"";
    const RULE_MODEM: &str = "allow id 0781:5591 hash \"Y\"";

    struct Fixture {
        root: TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                root: TempDir::new().unwrap(),
            }
        }

        fn user_db_dir(&self) -> PathBuf {
            let dir = self
                .root
                .path()
                .join(USER_DB_PARENT_DIR)
                .join("0123456789abcdef");
            std::fs::create_dir_all(&dir).unwrap();
            dir
        }

        fn manager(&self, with_user: bool, rule: &'static str) -> EntryManager {
            let user_dir = with_user.then(|| self.user_db_dir());
            EntryManager::new(
                self.root.path(),
                user_dir,
                Box::new(move |_| rule.to_string()),
            )
            .unwrap()
        }

        fn write_conf(&self, name: &str, contents: &str) {
            let dir = self.root.path().join(POLICY_DIR);
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join(name), contents).unwrap();
        }
    }

    fn age_trash(manager: &mut EntryManager, key: &str, seconds: i64) {
        let entry = manager
            .global_store_mut()
            .get_mut()
            .trash
            .get_mut(key)
            .unwrap();
        entry.last_used.seconds -= seconds;
    }

    #[test]
    fn simple_add_creates_single_entry() {
        let fx = Fixture::new();
        let mut manager = fx.manager(false, RULE_STORAGE);

        manager.handle_event(UdevAction::Add, DEVPATH).unwrap();

        let db = manager.global_store().get();
        let entry = &db.entries[&fingerprint(DEVPATH)];
        assert_eq!(entry.rules, vec![RULE_STORAGE.to_string()]);
        assert!(entry.last_used.seconds > 0);
        assert_eq!(db.entries.len(), 1);
        assert!(
            std::fs::metadata(manager.global_store().path())
                .unwrap()
                .len()
                > 0
        );
    }

    #[test]
    fn repeated_add_is_idempotent_on_rules() {
        let fx = Fixture::new();
        let mut manager = fx.manager(false, RULE_STORAGE);

        manager.handle_event(UdevAction::Add, DEVPATH).unwrap();
        manager.handle_event(UdevAction::Add, DEVPATH).unwrap();

        let entry = &manager.global_store().get().entries[&fingerprint(DEVPATH)];
        assert_eq!(entry.rules, vec![RULE_STORAGE.to_string()]);
    }

    #[test]
    fn remove_moves_entry_to_trash() {
        let fx = Fixture::new();
        let mut manager = fx.manager(false, RULE_STORAGE);
        let key = fingerprint(DEVPATH);

        manager.handle_event(UdevAction::Add, DEVPATH).unwrap();
        manager.handle_event(UdevAction::Remove, DEVPATH).unwrap();

        let db = manager.global_store().get();
        assert!(!db.entries.contains_key(&key));
        assert_eq!(db.trash[&key].rules, vec![RULE_STORAGE.to_string()]);
    }

    #[test]
    fn remove_unknown_devpath_is_ok() {
        let fx = Fixture::new();
        let mut manager = fx.manager(false, RULE_STORAGE);
        manager.handle_event(UdevAction::Remove, DEVPATH).unwrap();
        assert!(manager.global_store().get().trash.is_empty());
    }

    #[test]
    fn mode_switch_within_window_keeps_both_rules() {
        let fx = Fixture::new();
        let key = fingerprint(DEVPATH);

        let mut manager = fx.manager(false, RULE_STORAGE);
        manager.handle_event(UdevAction::Add, DEVPATH).unwrap();
        manager.handle_event(UdevAction::Remove, DEVPATH).unwrap();
        drop(manager);

        let mut manager = fx.manager(false, RULE_MODEM);
        manager.handle_event(UdevAction::Add, DEVPATH).unwrap();

        let db = manager.global_store().get();
        let entry = &db.entries[&key];
        assert_eq!(
            entry.rules,
            vec![RULE_STORAGE.to_string(), RULE_MODEM.to_string()]
        );
        assert!(!db.trash.contains_key(&key));
    }

    #[test]
    fn mode_switch_skips_identical_previous_mode() {
        let fx = Fixture::new();
        let mut manager = fx.manager(false, RULE_STORAGE);

        manager.handle_event(UdevAction::Add, DEVPATH).unwrap();
        manager.handle_event(UdevAction::Remove, DEVPATH).unwrap();
        manager.handle_event(UdevAction::Add, DEVPATH).unwrap();

        let entry = &manager.global_store().get().entries[&fingerprint(DEVPATH)];
        assert_eq!(entry.rules, vec![RULE_STORAGE.to_string()]);
    }

    #[test]
    fn expired_trash_is_not_reclaimed() {
        let fx = Fixture::new();
        let key = fingerprint(DEVPATH);

        let mut manager = fx.manager(false, RULE_STORAGE);
        manager.handle_event(UdevAction::Add, DEVPATH).unwrap();
        manager.handle_event(UdevAction::Remove, DEVPATH).unwrap();
        age_trash(&mut manager, &key, 5);
        drop(manager);

        let mut manager = fx.manager(false, RULE_MODEM);
        manager.handle_event(UdevAction::Add, DEVPATH).unwrap();

        let entry = &manager.global_store().get().entries[&key];
        assert_eq!(entry.rules, vec![RULE_MODEM.to_string()]);
    }

    #[test]
    fn gc_clears_aged_trash_but_keeps_user_entry() {
        let fx = Fixture::new();
        let key = fingerprint(DEVPATH);
        let mut manager = fx.manager(true, RULE_STORAGE);

        manager.handle_event(UdevAction::Add, DEVPATH).unwrap();
        manager.handle_event(UdevAction::Remove, DEVPATH).unwrap();
        age_trash(&mut manager, &key, 5);

        manager.garbage_collect().unwrap();

        assert!(!manager.global_store().get().trash.contains_key(&key));
        let user_key = fingerprint_rules(&[RULE_STORAGE]);
        assert!(manager
            .user_store()
            .unwrap()
            .get()
            .entries
            .contains_key(&user_key));
    }

    #[test]
    fn gc_never_touches_live_global_entries() {
        let fx = Fixture::new();
        let mut manager = fx.manager(false, RULE_STORAGE);
        manager.handle_event(UdevAction::Add, DEVPATH).unwrap();

        // Even an ancient live entry stays put.
        manager
            .global_store_mut()
            .get_mut()
            .entries
            .get_mut(&fingerprint(DEVPATH))
            .unwrap()
            .last_used = Timestamp::default();
        manager.garbage_collect().unwrap();

        assert_eq!(manager.global_store().get().entries.len(), 1);
    }

    #[test]
    fn remove_does_not_mutate_user_db() {
        let fx = Fixture::new();
        let mut manager = fx.manager(true, RULE_STORAGE);

        manager.handle_event(UdevAction::Add, DEVPATH).unwrap();
        let user_key = fingerprint_rules(&[RULE_STORAGE]);
        assert!(manager
            .user_store()
            .unwrap()
            .get()
            .entries
            .contains_key(&user_key));

        manager.handle_event(UdevAction::Remove, DEVPATH).unwrap();
        assert!(manager
            .user_store()
            .unwrap()
            .get()
            .entries
            .contains_key(&user_key));
    }

    #[test]
    fn user_login_copies_global_entries() {
        let fx = Fixture::new();

        let mut manager = fx.manager(false, RULE_STORAGE);
        manager.handle_event(UdevAction::Add, DEVPATH).unwrap();
        drop(manager);

        let mut manager = fx.manager(true, RULE_STORAGE);
        assert!(manager.user_store().unwrap().get().entries.is_empty());
        manager.handle_user_login().unwrap();

        let user_entries = &manager.user_store().unwrap().get().entries;
        let entry = &user_entries[&fingerprint_rules(&[RULE_STORAGE])];
        assert_eq!(entry.rules, vec![RULE_STORAGE.to_string()]);
    }

    #[test]
    fn user_login_without_user_db_fails() {
        let fx = Fixture::new();
        let mut manager = fx.manager(false, RULE_STORAGE);
        match manager.handle_user_login() {
            Err(Error::NoUserDb) => {}
            other => panic!("expected NoUserDb, got {:?}", other),
        }
    }

    #[test]
    fn devpath_validation_rejects_bad_paths() {
        let fx = Fixture::new();
        let mut manager = fx.manager(false, RULE_STORAGE);

        for bad in [
            "",
            "/devices/../etc/passwd",
            "/../devices/usb1",
            "/firmware/acpi",
            "/devices",
        ] {
            match manager.handle_event(UdevAction::Add, bad) {
                Err(Error::BadDevpath(_)) => {}
                other => panic!("devpath {:?} should be rejected, got {:?}", bad, other),
            }
        }
    }

    #[test]
    fn invalid_rule_from_devpath_fails() {
        let fx = Fixture::new();
        let mut manager = fx.manager(false, "not a rule");
        match manager.handle_event(UdevAction::Add, DEVPATH) {
            Err(Error::BadRule(_)) => {}
            other => panic!("expected BadRule, got {:?}", other),
        }
        assert!(manager.global_store().get().entries.is_empty());
    }

    #[test]
    fn generate_rules_orders_trusted_rules_before_drop_ins() {
        let fx = Fixture::new();
        fx.write_conf("99-block.conf", "block with-interface { 03:00:01 }");
        fx.write_conf("10-base.conf", "allow with-connect-type \"hotplug\"\n");

        let mut manager = fx.manager(false, RULE_STORAGE);
        manager.handle_event(UdevAction::Add, DEVPATH).unwrap();

        let rules = manager.generate_rules().unwrap();
        let lines: Vec<&str> = rules.lines().collect();
        assert_eq!(
            lines,
            vec![
                RULE_STORAGE,
                "allow with-connect-type \"hotplug\"",
                "block with-interface { 03:00:01 }",
            ]
        );
    }

    #[test]
    fn generate_rules_prefers_user_db_and_dedups() {
        let fx = Fixture::new();
        let mut manager = fx.manager(true, RULE_STORAGE);
        manager.handle_event(UdevAction::Add, DEVPATH).unwrap();

        // The same rule arriving from a second devpath must not duplicate
        // the generated output.
        let dup = RuleEntry {
            rules: vec![RULE_STORAGE.to_string()],
            last_used: Timestamp::now(),
        };
        manager
            .global_store_mut()
            .get_mut()
            .entries
            .insert("other-key".to_string(), dup);
        manager.handle_user_login().unwrap();

        let rules = manager.generate_rules().unwrap();
        assert_eq!(
            rules.lines().filter(|l| *l == RULE_STORAGE).count(),
            1,
            "rule should appear exactly once:\n{}",
            rules
        );
    }

    #[test]
    fn generate_rules_is_deterministic() {
        let fx = Fixture::new();
        fx.write_conf("20-extra.conf", "reject with-interface { ff:ff:ff }");
        let mut manager = fx.manager(false, RULE_STORAGE);
        manager.handle_event(UdevAction::Add, DEVPATH).unwrap();

        let a = manager.generate_rules().unwrap();
        let b = manager.generate_rules().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn persisted_state_survives_reopen() {
        let fx = Fixture::new();
        let mut manager = fx.manager(false, RULE_STORAGE);
        manager.handle_event(UdevAction::Add, DEVPATH).unwrap();
        drop(manager);

        let manager = fx.manager(false, RULE_STORAGE);
        assert!(manager
            .global_store()
            .get()
            .entries
            .contains_key(&fingerprint(DEVPATH)));
    }
}
