//! Durable session store.
//!
//! One session per user, persisted as flat `key=value` lines under the
//! user state directory. Writes go to a temp file and are renamed over
//! the target so a crash never leaves a half-written record. The file is
//! owner read/write only. There is no schema version field: unknown keys
//! are ignored and missing keys default, so older records still load.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::Result;
use crate::session::{PersistMode, Scope, Session, VpnState};

pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    /// Default record location: `<user state dir>/shroud/session`.
    pub fn default_path() -> PathBuf {
        dirs_next::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("shroud")
            .join("session")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the full record atomically with owner-only permissions.
    pub async fn save(&self, session: &Session) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Owner-only from the first byte: the record holds the connection
        // name and MAC snapshot.
        let temp = self.path.with_extension("tmp");
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&temp)
            .await?;
        file.write_all(encode(session).as_bytes()).await?;
        file.sync_all().await?;
        fs::rename(&temp, &self.path).await?;

        Ok(())
    }

    /// Load the record. `Ok(None)` when no record exists — a missing file
    /// is the normal inactive state, never an error.
    pub async fn load(&self) -> Result<Option<Session>> {
        match fs::read_to_string(&self.path).await {
            Ok(content) => Ok(Some(decode(&content))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove the record; a no-op if it is already gone.
    pub async fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Serialize a session to `key=value` lines.
pub fn encode(s: &Session) -> String {
    let mut out = String::new();
    let mut put = |k: &str, v: &str| {
        out.push_str(k);
        out.push('=');
        out.push_str(v);
        out.push('\n');
    };

    put("id", &s.id);
    put("active", if s.active { "true" } else { "false" });
    put("start_time", &s.start_time.to_rfc3339());
    if let Some(end) = s.end_time {
        put("end_time", &end.to_rfc3339());
    }
    let scope_list: Vec<&str> = s.scopes.iter().map(|sc| sc.name()).collect();
    put("scopes", &scope_list.join(","));
    put("persist_mode", s.persist_mode.name());
    put("remind", if s.remind { "true" } else { "false" });

    if let Some(v) = &s.firewall_table {
        put("firewall_table", v);
    }
    if let Some(v) = &s.connection {
        put("connection", v);
    }
    if let Some(v) = &s.identity_property {
        put("identity_property", v);
    }
    // previous_mac distinguishes "was unset" (key present, empty value)
    // from "never touched" (key absent).
    if let Some(v) = &s.previous_mac {
        put("previous_mac", v);
    }
    if let Some(v) = &s.requested_mac {
        put("requested_mac", v);
    }

    put("vpn_kind", s.vpn.kind());
    match &s.vpn {
        VpnState::None => {}
        VpnState::Tunnel { config, interface } => {
            put("vpn_config", &config.display().to_string());
            put("vpn_interface", interface);
        }
        VpnState::Managed { config, unit } => {
            put("vpn_config", &config.display().to_string());
            put("vpn_unit", unit);
        }
    }

    if let Some(v) = &s.browser_profile {
        put("browser_profile", &v.display().to_string());
    }
    if let Some(v) = s.browser_pid {
        put("browser_pid", &v.to_string());
    }
    if let Some(v) = &s.expire_job {
        put("expire_job", v);
    }
    if !s.remind_jobs.is_empty() {
        put("remind_jobs", &s.remind_jobs.join(","));
    }

    out
}

/// Parse `key=value` lines back into a session. Unknown keys are ignored
/// and missing keys fall back to empty/zero values.
pub fn decode(content: &str) -> Session {
    let mut s = Session::new(Vec::new(), None);
    s.id = String::new();
    s.active = false;
    s.start_time = DateTime::<Utc>::UNIX_EPOCH;

    let mut vpn_config: Option<PathBuf> = None;
    let mut vpn_interface = String::new();
    let mut vpn_unit = String::new();
    let mut vpn_kind = "none".to_string();

    for line in content.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        match key {
            "id" => s.id = value.to_string(),
            "active" => s.active = value == "true",
            "start_time" => {
                if let Ok(t) = DateTime::parse_from_rfc3339(value) {
                    s.start_time = t.with_timezone(&Utc);
                }
            }
            "end_time" => {
                if let Ok(t) = DateTime::parse_from_rfc3339(value) {
                    s.end_time = Some(t.with_timezone(&Utc));
                }
            }
            "scopes" => {
                s.scopes = value
                    .split(',')
                    .filter_map(Scope::from_name)
                    .collect();
            }
            "persist_mode" => {
                s.persist_mode = PersistMode::from_name(value).unwrap_or_default();
            }
            "remind" => s.remind = value == "true",
            "firewall_table" => s.firewall_table = Some(value.to_string()),
            "connection" => s.connection = Some(value.to_string()),
            "identity_property" => s.identity_property = Some(value.to_string()),
            "previous_mac" => s.previous_mac = Some(value.to_string()),
            "requested_mac" => s.requested_mac = Some(value.to_string()),
            "vpn_kind" => vpn_kind = value.to_string(),
            "vpn_config" => vpn_config = Some(PathBuf::from(value)),
            "vpn_interface" => vpn_interface = value.to_string(),
            "vpn_unit" => vpn_unit = value.to_string(),
            "browser_profile" => s.browser_profile = Some(PathBuf::from(value)),
            "browser_pid" => s.browser_pid = value.parse().ok(),
            "expire_job" => s.expire_job = Some(value.to_string()),
            "remind_jobs" => {
                s.remind_jobs = value.split(',').map(str::to_string).collect();
            }
            _ => {}
        }
    }

    s.vpn = match (vpn_kind.as_str(), vpn_config) {
        ("tunnel", Some(config)) => VpnState::Tunnel {
            config,
            interface: vpn_interface,
        },
        ("managed", Some(config)) => VpnState::Managed {
            config,
            unit: vpn_unit,
        },
        _ => VpnState::None,
    };

    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    fn sample() -> Session {
        let mut s = Session::new(vec![Scope::Firewall, Scope::Identity, Scope::Vpn], None);
        s.end_time = Some(s.start_time + Duration::seconds(3600));
        s.remind = true;
        s.firewall_table = Some("shroud-killswitch".into());
        s.connection = Some("home-wifi".into());
        s.identity_property = Some("802-11-wireless.cloned-mac-address".into());
        s.previous_mac = Some(String::new());
        s.requested_mac = Some("random".into());
        s.vpn = VpnState::Tunnel {
            config: PathBuf::from("/etc/wireguard/wg0.conf"),
            interface: "wg0".into(),
        };
        s.expire_job = Some("shroud-expire-abcd1234".into());
        s.remind_jobs = vec!["shroud-remind-abcd1234-50pct".into()];
        s
    }

    #[test]
    fn test_codec_round_trip() {
        let s = sample();
        let decoded = decode(&encode(&s));
        assert_eq!(decoded.id, s.id);
        assert!(decoded.active);
        assert_eq!(decoded.start_time, s.start_time);
        assert_eq!(decoded.end_time, s.end_time);
        assert_eq!(decoded.scopes, s.scopes);
        assert_eq!(decoded.firewall_table, s.firewall_table);
        assert_eq!(decoded.vpn, s.vpn);
        assert_eq!(decoded.remind_jobs, s.remind_jobs);
    }

    #[test]
    fn test_previous_mac_unset_vs_untouched() {
        let s = sample();
        let decoded = decode(&encode(&s));
        // key present with empty value: the property existed but was unset
        assert_eq!(decoded.previous_mac, Some(String::new()));

        let mut untouched = sample();
        untouched.previous_mac = None;
        let decoded = decode(&encode(&untouched));
        assert_eq!(decoded.previous_mac, None);
    }

    #[test]
    fn test_decode_tolerates_legacy_fields() {
        let content = "id=old\nactive=true\nscopes=firewall\nsome_future_key=zzz\n";
        let s = decode(content);
        assert_eq!(s.id, "old");
        assert!(s.active);
        assert_eq!(s.scopes, vec![Scope::Firewall]);
        assert_eq!(s.end_time, None);
        assert_eq!(s.vpn, VpnState::None);
    }

    #[tokio::test]
    async fn test_store_save_load_clear() {
        let dir = tempdir().unwrap();
        let store = SessionStore::new(dir.path().join("session"));

        assert!(store.load().await.unwrap().is_none());

        let s = sample();
        store.save(&s).await.unwrap();

        let mode = std::fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded.id, s.id);

        store.clear().await.unwrap();
        assert!(store.load().await.unwrap().is_none());

        // clear is a no-op when already gone
        store.clear().await.unwrap();
    }

    #[tokio::test]
    async fn test_store_missing_parent_dir() {
        let dir = tempdir().unwrap();
        let store = SessionStore::new(dir.path().join("nested").join("session"));
        store.save(&sample()).await.unwrap();
        assert!(store.load().await.unwrap().is_some());
    }
}
