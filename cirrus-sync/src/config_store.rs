//! Persisted sync configs
//!
//! Configs are stored per drive: internal syncs in the per-user store,
//! external backups on the drive itself, so the drive carries its own
//! registration. Each store writes two alternating slots (`<prefix>.0`,
//! `<prefix>.1`) so a torn write can never destroy the only copy. The
//! payload is a JSON document encrypted with AES-128-CBC under a per-user
//! key and authenticated with HMAC-SHA-256 over the IV and ciphertext; a
//! monotonically increasing counter inside the envelope selects the newer
//! slot, and an unauthentic newer slot falls back to the older one.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::errors::{Result, SyncError};

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type HmacSha256 = Hmac<Sha256>;

pub const CONFIG_FILE_PREFIX: &str = "syncconfigs";
const IV_LEN: usize = 16;
const TAG_LEN: usize = 32;

/// Keys for the config envelope, derived from a per-user secret.
#[derive(Clone)]
pub struct ConfigCipher {
    enc_key: [u8; 16],
    mac_key: [u8; 32],
}

impl ConfigCipher {
    pub fn derive(user_key: &[u8]) -> Self {
        let mut enc_key = [0u8; 16];
        let mut hasher = Sha256::new();
        hasher.update(user_key);
        hasher.update(b"cirrus-config-enc");
        enc_key.copy_from_slice(&hasher.finalize()[..16]);

        let mut mac_key = [0u8; 32];
        let mut hasher = Sha256::new();
        hasher.update(user_key);
        hasher.update(b"cirrus-config-mac");
        mac_key.copy_from_slice(&hasher.finalize());

        Self { enc_key, mac_key }
    }

    fn seal(&self, plaintext: &[u8]) -> Vec<u8> {
        let iv: [u8; IV_LEN] = rand::random();
        let ciphertext = Aes128CbcEnc::new(&self.enc_key.into(), &iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

        let mut mac = HmacSha256::new_from_slice(&self.mac_key).expect("any key length works");
        mac.update(&iv);
        mac.update(&ciphertext);
        let tag = mac.finalize().into_bytes();

        let mut out = Vec::with_capacity(IV_LEN + ciphertext.len() + TAG_LEN);
        out.extend_from_slice(&iv);
        out.extend_from_slice(&ciphertext);
        out.extend_from_slice(&tag);
        out
    }

    fn unseal(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < IV_LEN + TAG_LEN {
            return Err(SyncError::ConfigAuth);
        }
        let (body, tag) = data.split_at(data.len() - TAG_LEN);
        let (iv, ciphertext) = body.split_at(IV_LEN);

        let mut mac = HmacSha256::new_from_slice(&self.mac_key).expect("any key length works");
        mac.update(iv);
        mac.update(ciphertext);
        mac.verify_slice(tag).map_err(|_| SyncError::ConfigAuth)?;

        let iv: [u8; IV_LEN] = iv.try_into().expect("split length");
        Aes128CbcDec::new(&self.enc_key.into(), &iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| SyncError::ConfigAuth)
    }
}

#[derive(Serialize, Deserialize)]
struct ConfigDocument {
    counter: u64,
    configs: Vec<SyncConfig>,
}

#[derive(Debug, Default, Clone)]
struct DriveInfo {
    /// Slot the *next* write goes to.
    next_slot: u8,
    counter: u64,
    dirty: bool,
}

pub struct SyncConfigStore {
    base_dir: PathBuf,
    cipher: ConfigCipher,
    drives: HashMap<PathBuf, DriveInfo>,
}

impl SyncConfigStore {
    pub fn new(base_dir: PathBuf, cipher: ConfigCipher) -> Self {
        Self {
            base_dir,
            cipher,
            drives: HashMap::new(),
        }
    }

    /// The drive key under which internal (non-external-backup) syncs live.
    pub fn internal_drive(&self) -> PathBuf {
        self.base_dir.clone()
    }

    fn prefix_for(&self, drive: &Path) -> PathBuf {
        if drive == self.base_dir {
            self.base_dir.join(CONFIG_FILE_PREFIX)
        } else {
            drive.join(".cirrus").join(CONFIG_FILE_PREFIX)
        }
    }

    fn slot_path(&self, drive: &Path, slot: u8) -> PathBuf {
        let mut path = self.prefix_for(drive).into_os_string();
        path.push(format!(".{}", slot));
        PathBuf::from(path)
    }

    /// Read a drive's configs, preferring the newer authentic slot.
    pub fn read(&mut self, drive: &Path) -> Result<Vec<SyncConfig>> {
        let mut best: Option<(u8, ConfigDocument)> = None;
        let mut saw_file = false;
        for slot in 0..2u8 {
            let path = self.slot_path(drive, slot);
            let data = match fs::read(&path) {
                Ok(data) => data,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(SyncError::ConfigIo(e)),
            };
            saw_file = true;
            let document = match self
                .cipher
                .unseal(&data)
                .and_then(|pt| Ok(serde_json::from_slice::<ConfigDocument>(&pt)?))
            {
                Ok(doc) => doc,
                Err(e) => {
                    warn!("config slot {:?} rejected: {}", path, e);
                    continue;
                }
            };
            let newer = best
                .as_ref()
                .map(|(_, b)| document.counter > b.counter)
                .unwrap_or(true);
            if newer {
                best = Some((slot, document));
            }
        }

        match best {
            Some((slot, document)) => {
                debug!(
                    "configs for {:?} from slot {} (counter {})",
                    drive, slot, document.counter
                );
                self.drives.insert(
                    drive.to_path_buf(),
                    DriveInfo {
                        next_slot: slot ^ 1,
                        counter: document.counter,
                        dirty: false,
                    },
                );
                Ok(document.configs)
            }
            None if saw_file => Err(SyncError::ConfigAuth),
            None => {
                self.drives.insert(drive.to_path_buf(), DriveInfo::default());
                Ok(Vec::new())
            }
        }
    }

    /// Write a drive's configs to the non-current slot.
    pub fn write(&mut self, drive: &Path, configs: &[SyncConfig]) -> Result<()> {
        let info = self.drives.entry(drive.to_path_buf()).or_default();
        let document = ConfigDocument {
            counter: info.counter + 1,
            configs: configs.to_vec(),
        };
        let plaintext = serde_json::to_vec(&document)?;
        let sealed = self.cipher.seal(&plaintext);

        let slot = info.next_slot;
        let path = self.slot_path(drive, slot);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(SyncError::ConfigIo)?;
        }
        fs::write(&path, sealed).map_err(SyncError::ConfigIo)?;

        let info = self.drives.get_mut(drive).expect("inserted above");
        info.counter += 1;
        info.next_slot = slot ^ 1;
        info.dirty = false;
        info!("wrote {} configs for {:?} to slot {}", configs.len(), drive, slot);
        Ok(())
    }

    pub fn mark_dirty(&mut self, drive: &Path) {
        self.drives.entry(drive.to_path_buf()).or_default().dirty = true;
    }

    pub fn dirty(&self) -> bool {
        self.drives.values().any(|d| d.dirty)
    }

    pub fn dirty_drives(&self) -> Vec<PathBuf> {
        self.drives
            .iter()
            .filter(|(_, info)| info.dirty)
            .map(|(drive, _)| drive.clone())
            .collect()
    }

    pub fn known_drives(&self) -> Vec<PathBuf> {
        self.drives.keys().cloned().collect()
    }

    pub fn remove_drive(&mut self, drive: &Path) {
        self.drives.remove(drive);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChangeDetection, RemoteRoot, SyncType};
    use cirrus_cloud::NodeHandle;
    use cirrus_fs::VolumeFingerprint;

    fn sample_config(id: u64) -> SyncConfig {
        SyncConfig {
            backup_id: id,
            name: format!("sync-{}", id),
            local_root: PathBuf::from("/data"),
            remote_root: RemoteRoot {
                handle: NodeHandle(44),
                path: "/data".into(),
            },
            filesystem_fingerprint: VolumeFingerprint(3),
            local_root_fsid: 17,
            sync_type: SyncType::TwoWay,
            enabled: true,
            error: None,
            warning: None,
            run_state: Default::default(),
            backup_state: None,
            change_detection: ChangeDetection::Notifications,
            scan_interval_secs: 0,
            external_drive_path: None,
        }
    }

    fn store(dir: &Path) -> SyncConfigStore {
        SyncConfigStore::new(dir.to_path_buf(), ConfigCipher::derive(b"user secret"))
    }

    #[test]
    fn roundtrip_through_slots() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = store(dir.path());
        let drive = s.internal_drive();

        assert!(s.read(&drive).unwrap().is_empty());
        s.write(&drive, &[sample_config(1)]).unwrap();
        s.write(&drive, &[sample_config(1), sample_config(2)]).unwrap();

        // A fresh store picks the newer slot.
        let mut s2 = store(dir.path());
        let configs = s2.read(&drive).unwrap();
        assert_eq!(configs.len(), 2);
    }

    #[test]
    fn tampered_newer_slot_falls_back_to_older() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = store(dir.path());
        let drive = s.internal_drive();

        s.write(&drive, &[sample_config(1)]).unwrap(); // slot 0, counter 1
        s.write(&drive, &[sample_config(1), sample_config(2)]).unwrap(); // slot 1, counter 2

        // Corrupt the newer slot.
        let newer = s.slot_path(&drive, 1);
        let mut bytes = fs::read(&newer).unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xff;
        fs::write(&newer, bytes).unwrap();

        let mut s2 = store(dir.path());
        let configs = s2.read(&drive).unwrap();
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].backup_id, 1);
    }

    #[test]
    fn wrong_key_fails_authentication() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = store(dir.path());
        let drive = s.internal_drive();
        s.write(&drive, &[sample_config(1)]).unwrap();

        let mut other = SyncConfigStore::new(
            dir.path().to_path_buf(),
            ConfigCipher::derive(b"different secret"),
        );
        match other.read(&drive) {
            Err(SyncError::ConfigAuth) => {}
            other => panic!("expected auth failure, got {:?}", other.map(|c| c.len())),
        }
    }

    #[test]
    fn external_drive_uses_its_own_prefix() {
        let user_dir = tempfile::tempdir().unwrap();
        let drive_dir = tempfile::tempdir().unwrap();
        let mut s = store(user_dir.path());

        s.write(drive_dir.path(), &[sample_config(7)]).unwrap();
        assert!(drive_dir.path().join(".cirrus").exists());

        let configs = s.read(drive_dir.path()).unwrap();
        assert_eq!(configs[0].backup_id, 7);
    }

    #[test]
    fn dirty_tracking() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = store(dir.path());
        let drive = s.internal_drive();
        assert!(!s.dirty());
        s.mark_dirty(&drive);
        assert!(s.dirty());
        assert_eq!(s.dirty_drives(), vec![drive.clone()]);
        s.write(&drive, &[]).unwrap();
        assert!(!s.dirty());
    }
}
