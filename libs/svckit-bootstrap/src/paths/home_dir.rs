use std::{
    env, fs,
    path::{Path, PathBuf},
};

/// Errors for resolving the runtime home directory.
#[derive(Debug, thiserror::Error)]
pub enum HomeDirError {
    #[error("no user home directory: {0} is not set")]
    UserHomeMissing(&'static str),
    #[error("home_dir must be an absolute path (after ~ expansion): {0}")]
    AbsoluteRequired(String),
    #[error("failed to create home_dir: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(target_os = "windows")]
const USER_HOME_VARS: &[&str] = &["USERPROFILE", "HOME"];
#[cfg(not(target_os = "windows"))]
const USER_HOME_VARS: &[&str] = &["HOME"];

#[cfg(target_os = "windows")]
const DEFAULT_BASE_VAR: &str = "APPDATA";
#[cfg(not(target_os = "windows"))]
const DEFAULT_BASE_VAR: &str = "HOME";

/// Normalize and resolve the runtime home directory.
///
/// A configured path may start with `~`, which expands to the user's home
/// (`$HOME`, or `%USERPROFILE%` on Windows); the result must be absolute.
/// Without one, `<base>/<default_subdir>` is used where `base` is `$HOME`
/// (`%APPDATA%` on Windows).
///
/// If `create` is true, the directory is created if missing.
pub fn resolve_home_dir(
    config_home: Option<String>,
    default_subdir: &str,
    create: bool,
) -> Result<PathBuf, HomeDirError> {
    let user_home = USER_HOME_VARS
        .iter()
        .find_map(|var| env::var_os(var))
        .map(PathBuf::from);
    let default_base = env::var_os(DEFAULT_BASE_VAR).map(PathBuf::from);

    let path = resolve_with(config_home, default_subdir, user_home, default_base)?;
    if create {
        fs::create_dir_all(&path)?;
    }
    Ok(path)
}

fn resolve_with(
    config_home: Option<String>,
    default_subdir: &str,
    user_home: Option<PathBuf>,
    default_base: Option<PathBuf>,
) -> Result<PathBuf, HomeDirError> {
    let Some(raw) = config_home.filter(|s| !s.trim().is_empty()) else {
        let base = default_base.ok_or(HomeDirError::UserHomeMissing(DEFAULT_BASE_VAR))?;
        return Ok(base.join(default_subdir));
    };

    let expanded = match raw.strip_prefix('~') {
        Some(rest) => {
            let home = user_home.ok_or(HomeDirError::UserHomeMissing(USER_HOME_VARS[0]))?;
            // "~user" forms are not supported; the remainder joins the caller's home.
            let rest = rest.trim_start_matches(['/', '\\']);
            if rest.is_empty() {
                home
            } else {
                home.join(rest)
            }
        }
        None => PathBuf::from(&raw),
    };

    if !Path::new(&expanded).is_absolute() {
        return Err(HomeDirError::AbsoluteRequired(
            expanded.to_string_lossy().into_owned(),
        ));
    }
    Ok(expanded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn resolve(raw: Option<&str>, home: &Path) -> Result<PathBuf, HomeDirError> {
        resolve_with(
            raw.map(str::to_string),
            ".svckit",
            Some(home.to_path_buf()),
            Some(home.to_path_buf()),
        )
    }

    #[test]
    fn tilde_expands_to_user_home() {
        let tmp = tempdir().unwrap();
        let result = resolve(Some("~/myapp"), tmp.path()).unwrap();
        assert_eq!(result, tmp.path().join("myapp"));

        let result = resolve(Some("~"), tmp.path()).unwrap();
        assert_eq!(result, tmp.path());
    }

    #[test]
    fn default_uses_subdir_of_base() {
        let tmp = tempdir().unwrap();
        let result = resolve(None, tmp.path()).unwrap();
        assert_eq!(result, tmp.path().join(".svckit"));

        // Blank counts as not configured.
        let result = resolve(Some("  "), tmp.path()).unwrap();
        assert_eq!(result, tmp.path().join(".svckit"));
    }

    #[test]
    fn absolute_path_is_kept() {
        let tmp = tempdir().unwrap();
        let abs = tmp.path().join("custom_dir");
        let result = resolve(Some(abs.to_str().unwrap()), Path::new("/unused")).unwrap();
        assert_eq!(result, abs);
    }

    #[test]
    fn relative_path_is_rejected() {
        let tmp = tempdir().unwrap();
        match resolve(Some("relative/path"), tmp.path()).unwrap_err() {
            HomeDirError::AbsoluteRequired(p) => assert!(p.contains("relative")),
            other => panic!("expected AbsoluteRequired, got {other:?}"),
        }
    }

    #[test]
    fn missing_base_is_reported() {
        let err = resolve_with(None, ".svckit", None, None).unwrap_err();
        assert!(matches!(err, HomeDirError::UserHomeMissing(_)));

        let err = resolve_with(Some("~/x".into()), ".svckit", None, None).unwrap_err();
        assert!(matches!(err, HomeDirError::UserHomeMissing(_)));
    }

    #[test]
    fn configured_directory_is_created() {
        let tmp = tempdir().unwrap();
        let target = tmp.path().join("nested").join("home");
        let result =
            resolve_home_dir(Some(target.to_string_lossy().into_owned()), ".svckit", true).unwrap();
        assert_eq!(result, target);
        assert!(target.is_dir());
    }
}
