//! Pass driver - gpg-encrypted entries in a password-store style directory
//!
//! Each secret is `<root>/<id>.gpg`, encrypted to the configured key.
//! Options:
//! - `root`: store directory (default ~/.password-store)
//! - `key`: recipient key ID (default: gpg's own default key)
//! - `gpghomedir`: isolated gpg home directory

use anyhow::{bail, Context, Result};
use keeper_core::{Invocation, Paths};
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use super::{command_failed, optional_option, Driver, DriverSettings, DriverType};
use crate::error::SecretsError;
use crate::validate::validate_key;

const ENTRY_SUFFIX: &str = ".gpg";

pub struct PassDriver {
    root: PathBuf,
    key: Option<String>,
    gpg_home: Option<PathBuf>,
    gpg_binary: String,
    timeout: Duration,
    max_output: usize,
}

impl PassDriver {
    pub fn from_options(options: &BTreeMap<String, String>, settings: &DriverSettings) -> Result<Self> {
        let root = optional_option(options, "root")
            .map(PathBuf::from)
            .unwrap_or_else(Paths::password_store);

        Ok(Self {
            root,
            key: optional_option(options, "key").map(str::to_string),
            gpg_home: optional_option(options, "gpghomedir").map(PathBuf::from),
            gpg_binary: settings.gpg_binary.clone(),
            timeout: settings.timeout,
            max_output: settings.max_output,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, id: &str) -> Result<PathBuf> {
        validate_key(id)?;
        Ok(self.root.join(format!("{}{}", id, ENTRY_SUFFIX)))
    }

    /// Base gpg invocation: non-interactive, optionally with an isolated home
    fn gpg(&self) -> Invocation {
        let mut invocation = Invocation::new(self.gpg_binary.as_str())
            .arg("--batch")
            .timeout(self.timeout);
        if let Some(home) = &self.gpg_home {
            invocation = invocation
                .arg("--homedir")
                .arg(home.to_string_lossy());
        }
        invocation
    }

    fn ensure_root(&self) -> Result<()> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("Failed to create password store: {}", self.root.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.root, fs::Permissions::from_mode(0o700))
                .with_context(|| format!("Failed to secure {}", self.root.display()))?;
        }

        Ok(())
    }
}

impl Driver for PassDriver {
    fn driver_type(&self) -> DriverType {
        DriverType::Pass
    }

    fn store(&self, id: &str, data: &[u8]) -> Result<()> {
        let path = self.entry_path(id)?;
        if path.exists() {
            bail!(SecretsError::AlreadyExists(id.to_string()));
        }
        self.ensure_root()?;

        let invocation = match &self.key {
            Some(key) => self.gpg().arg("--default-recipient").arg(key.as_str()),
            None => self.gpg().arg("--default-recipient-self"),
        }
        .arg("--encrypt")
        .arg("--output")
        .arg(path.to_string_lossy());

        let failure: anyhow::Error = match invocation.run(Some(data)) {
            Ok(output) if output.success() => {
                debug!("Encrypted secret {} into {}", id, path.display());
                return Ok(());
            }
            Ok(output) => command_failed(DriverType::Pass, "store", id, &output).into(),
            Err(e) => e,
        };

        // Nothing was there before; anything now present is a partial write
        match fs::remove_file(&path) {
            Ok(()) => Err(failure),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(failure),
            Err(e) => bail!(SecretsError::Orphaned {
                id: id.to_string(),
                driver: DriverType::Pass.as_str(),
                context: format!("partial entry after failed store: {:#}", failure),
                reason: format!("failed to remove {}: {}", path.display(), e),
            }),
        }
    }

    fn lookup(&self, id: &str) -> Result<Vec<u8>> {
        let path = self.entry_path(id)?;
        if !path.is_file() {
            bail!(SecretsError::NotFound(id.to_string()));
        }

        let output = self
            .gpg()
            .arg("--quiet")
            .arg("--decrypt")
            .arg(path.to_string_lossy())
            .output_limit(self.max_output)
            .run(None)?;
        if !output.success() {
            bail!(command_failed(DriverType::Pass, "lookup", id, &output));
        }

        Ok(output.stdout)
    }

    fn delete(&self, id: &str) -> Result<()> {
        let path = self.entry_path(id)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                bail!(SecretsError::NotFound(id.to_string()))
            }
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
        }
    }

    fn list(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to list {}", self.root.display()))
            }
        };

        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(id) = name.strip_suffix(ENTRY_SUFFIX) {
                if validate_key(id).is_ok() {
                    ids.push(id.to_string());
                }
            }
        }

        ids.sort();
        Ok(ids)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    /// Stand-in for gpg: "encrypts" by copying stdin to --output and
    /// "decrypts" by printing the file. Records its arguments.
    const FAKE_GPG: &str = r#"#!/bin/sh
echo "$@" >> "$(dirname "$0")/calls.log"
out=""
dec=""
while [ $# -gt 0 ]; do
    case "$1" in
        --output) out="$2"; shift ;;
        --decrypt) dec="$2"; shift ;;
        --homedir) shift ;;
        --default-recipient) shift ;;
    esac
    shift
done
if [ -n "$dec" ]; then
    cat "$dec"
elif [ -n "$out" ]; then
    cat > "$out"
else
    echo "unexpected invocation" >&2
    exit 2
fi
"#;

    const FAILING_GPG: &str = "#!/bin/sh\ncat > /dev/null\necho 'gpg: no default secret key' >&2\nexit 2\n";

    /// Writes the entry, then hangs past any sensible timeout
    const HANGING_GPG: &str = r#"#!/bin/sh
out=""
while [ $# -gt 0 ]; do
    case "$1" in
        --output) out="$2"; shift ;;
    esac
    shift
done
cat > "$out"
exec sleep 30
"#;

    fn write_script(dir: &Path, body: &str) -> String {
        let path = dir.join("gpg");
        fs::write(&path, body).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().to_string()
    }

    fn temp_driver(script: &str) -> (PassDriver, TempDir) {
        temp_driver_with(script, DriverSettings::default())
    }

    fn temp_driver_with(script: &str, settings: DriverSettings) -> (PassDriver, TempDir) {
        let temp = TempDir::new().unwrap();
        let bin = temp.path().join("bin");
        fs::create_dir_all(&bin).unwrap();

        let settings = DriverSettings {
            gpg_binary: write_script(&bin, script),
            ..settings
        };
        let options = BTreeMap::from([
            ("root".to_string(), temp.path().join("store").to_string_lossy().to_string()),
            ("key".to_string(), "ABCDEF0123456789".to_string()),
            ("gpghomedir".to_string(), temp.path().join("gnupg").to_string_lossy().to_string()),
        ]);
        let driver = PassDriver::from_options(&options, &settings).unwrap();
        (driver, temp)
    }

    fn kind(err: &anyhow::Error) -> Option<&SecretsError> {
        err.downcast_ref::<SecretsError>()
    }

    #[test]
    fn test_store_lookup_via_gpg() {
        let (driver, temp) = temp_driver(FAKE_GPG);

        driver.store("abc123", b"mydata").unwrap();
        assert!(temp.path().join("store").join("abc123.gpg").is_file());
        assert_eq!(driver.lookup("abc123").unwrap(), b"mydata");

        let calls = fs::read_to_string(temp.path().join("bin").join("calls.log")).unwrap();
        assert!(calls.contains("--default-recipient ABCDEF0123456789"));
        assert!(calls.contains("--homedir"));
        assert!(calls.contains("--batch"));
    }

    #[test]
    fn test_store_refuses_overwrite() {
        let (driver, _temp) = temp_driver(FAKE_GPG);

        driver.store("abc123", b"first").unwrap();
        let err = driver.store("abc123", b"second").unwrap_err();
        assert!(matches!(kind(&err), Some(SecretsError::AlreadyExists(_))));
        assert_eq!(driver.lookup("abc123").unwrap(), b"first");
    }

    #[test]
    fn test_missing_entry_is_not_found() {
        let (driver, temp) = temp_driver(FAKE_GPG);

        let err = driver.lookup("nothere").unwrap_err();
        assert!(matches!(kind(&err), Some(SecretsError::NotFound(_))));
        let err = driver.delete("nothere").unwrap_err();
        assert!(matches!(kind(&err), Some(SecretsError::NotFound(_))));

        // Absence is decided without running gpg
        assert!(!temp.path().join("bin").join("calls.log").exists());
    }

    #[test]
    fn test_list_and_delete() {
        let (driver, temp) = temp_driver(FAKE_GPG);

        driver.store("bbb", b"2").unwrap();
        driver.store("aaa", b"1").unwrap();
        fs::write(temp.path().join("store").join(".gpg-id"), "ABCDEF").unwrap();
        assert_eq!(driver.list().unwrap(), vec!["aaa", "bbb"]);

        driver.delete("aaa").unwrap();
        assert_eq!(driver.list().unwrap(), vec!["bbb"]);
    }

    #[test]
    fn test_gpg_failure_is_driver_error() {
        let (driver, temp) = temp_driver(FAILING_GPG);

        let err = driver.store("abc123", b"mydata").unwrap_err();
        match kind(&err) {
            Some(SecretsError::Driver { driver, op, reason, .. }) => {
                assert_eq!(*driver, "pass");
                assert_eq!(*op, "store");
                assert!(reason.contains("exit code 2"));
                assert!(reason.contains("no default secret key"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(!temp.path().join("store").join("abc123.gpg").exists());
    }

    #[test]
    fn test_timed_out_store_leaves_no_entry() {
        let settings = DriverSettings {
            timeout: Duration::from_millis(500),
            ..DriverSettings::default()
        };
        let (driver, temp) = temp_driver_with(HANGING_GPG, settings);

        let err = driver.store("abc123", b"mydata").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<keeper_core::ProcessError>(),
            Some(keeper_core::ProcessError::Timeout { .. })
        ));
        assert!(!temp.path().join("store").join("abc123.gpg").exists());
        assert!(driver.list().unwrap().is_empty());
    }

    #[test]
    fn test_decrypt_output_is_bounded() {
        let settings = DriverSettings {
            max_output: 4,
            ..DriverSettings::default()
        };
        let (driver, _temp) = temp_driver_with(FAKE_GPG, settings);

        driver.store("abc123", b"longer than four").unwrap();
        let err = driver.lookup("abc123").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<keeper_core::ProcessError>(),
            Some(keeper_core::ProcessError::OutputTooLarge { limit: 4, .. })
        ));
    }

    #[test]
    fn test_traversal_rejected_before_gpg() {
        let (driver, temp) = temp_driver(FAKE_GPG);

        let id = "../../../etc/passwd";
        for err in [
            driver.store(id, b"x").unwrap_err(),
            driver.lookup(id).unwrap_err(),
            driver.delete(id).unwrap_err(),
        ] {
            assert!(matches!(kind(&err), Some(SecretsError::InvalidKey { .. })));
        }
        assert!(!temp.path().join("bin").join("calls.log").exists());
    }

    #[test]
    fn test_default_root() {
        let driver = PassDriver::from_options(&BTreeMap::new(), &DriverSettings::default()).unwrap();
        assert!(driver.root().ends_with(".password-store"));
    }
}
