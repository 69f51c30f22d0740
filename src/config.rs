use std::{
    ffi::OsStr,
    path::{Path, PathBuf},
};

use tracing::debug;

use crate::Error;

pub const KRB5_CONFIG: &str = "KRB5_CONFIG";
pub const KRB5_KTNAME: &str = "KRB5_KTNAME";

/// Where the Kerberos library finds its configuration and keytab.
///
/// The system GSS-API library reads these from the process environment when it first
/// needs them, so [`Krb5Environment::apply`] must run before the first provider call.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Krb5Environment {
    config: Option<PathBuf>,
    keytab: Option<PathBuf>,
}
impl Krb5Environment {
    pub fn new() -> Self {
        Self::default()
    }
    /// The paths currently set in the environment.
    pub fn from_env() -> Self {
        Self {
            config: std::env::var_os(KRB5_CONFIG).map(PathBuf::from),
            keytab: std::env::var_os(KRB5_KTNAME).map(PathBuf::from),
        }
    }
    #[must_use]
    pub fn with_config(self, path: impl Into<PathBuf>) -> Self {
        Self {
            config: Some(path.into()),
            ..self
        }
    }
    #[must_use]
    pub fn with_keytab(self, path: impl Into<PathBuf>) -> Self {
        Self {
            keytab: Some(path.into()),
            ..self
        }
    }
    pub fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
    pub fn keytab(&self) -> Option<&Path> {
        self.keytab.as_deref()
    }
    /// The variables [`apply`](Self::apply) would set, in order.
    pub fn pairs(&self) -> impl Iterator<Item = (&'static str, &Path)> {
        [(KRB5_CONFIG, self.config()), (KRB5_KTNAME, self.keytab())]
            .into_iter()
            .filter_map(|(key, value)| value.map(|value| (key, value)))
    }
    /// Exports the configured paths. Unset fields leave the environment untouched.
    pub fn apply(&self) -> Result<(), Error> {
        for (key, value) in self.pairs() {
            validate(key, value.as_os_str())?;
        }
        for (key, value) in self.pairs() {
            debug!(key, value = %value.display(), "setting Kerberos environment");
            std::env::set_var(key, value);
        }
        Ok(())
    }
}

fn validate(key: &str, value: &OsStr) -> Result<(), Error> {
    if value.is_empty() {
        return Err(Error::Config(format!("{key} must not be empty")));
    }
    if value.as_encoded_bytes().contains(&0) {
        return Err(Error::Config(format!("{key} must not contain a NUL byte")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pairs_skip_unset_fields() {
        let env = Krb5Environment::new().with_keytab("/etc/krb5.keytab");
        let pairs: Vec<_> = env.pairs().collect();
        assert_eq!(pairs, [(KRB5_KTNAME, Path::new("/etc/krb5.keytab"))]);
        assert!(Krb5Environment::new().pairs().next().is_none());
    }

    #[test]
    fn invalid_paths_are_config_errors() {
        let err = Krb5Environment::new().with_config("").apply().unwrap_err();
        assert!(matches!(err, Error::Config(ref msg) if msg.contains(KRB5_CONFIG)));
        let err = Krb5Environment::new()
            .with_config("/etc/krb5.conf")
            .with_keytab("bad\0path")
            .apply()
            .unwrap_err();
        assert!(matches!(err, Error::Config(ref msg) if msg.contains("NUL")));
    }
}
