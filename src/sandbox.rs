//! Path validation for everything that touches a session workspace.
//!
//! Security model:
//!   1. Candidates are percent-decoded twice and rejected outright if any
//!      segment is `..`, before the filesystem is touched.
//!   2. Relative candidates are joined onto the workspace root.
//!   3. The result is canonicalised (symlinks resolved) and must live under
//!      the canonical root. Containment is checked component-wise on
//!      canonical paths, never on raw strings.
//!   4. For paths that don't exist yet, the deepest existing ancestor is
//!      canonicalised instead and the missing suffix must be plain names.
//!   5. Components below the root starting with `.` are rejected unless
//!      hidden paths are allowed.

use std::io;
use std::path::{Component, Path, PathBuf};

/// Why a candidate path was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    #[error("path traversal rejected: {path}")]
    Traversal { path: String },

    #[error("path resolves outside the workspace: {path}")]
    OutsideWorkspace { path: String },

    #[error("invalid path: {reason}")]
    Invalid { reason: String },

    #[error("hidden path component rejected: {component}")]
    HiddenComponent { component: String },

    #[error("symbolic link in path chain: {path}")]
    Symlink { path: String },

    #[error("workspace directory not found: {path}")]
    WorkspaceNotFound { path: String },

    #[error("not a directory: {path}")]
    NotADirectory { path: String },
}

impl PathError {
    pub fn code(&self) -> &'static str {
        match self {
            PathError::Traversal { .. } => "PATH_TRAVERSAL",
            PathError::OutsideWorkspace { .. } => "PATH_OUTSIDE_WORKSPACE",
            PathError::Invalid { .. } => "INVALID_PATH",
            PathError::HiddenComponent { .. } => "PATH_HIDDEN",
            PathError::Symlink { .. } => "PATH_SYMLINK",
            PathError::WorkspaceNotFound { .. } => "WORKSPACE_NOT_FOUND",
            PathError::NotADirectory { .. } => "NOT_A_DIRECTORY",
        }
    }

    fn invalid(reason: impl Into<String>) -> Self {
        PathError::Invalid {
            reason: reason.into(),
        }
    }
}

/// A canonical, existing directory that bounds all access for one workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceRoot {
    path: PathBuf,
}

impl WorkspaceRoot {
    /// Canonicalise `path` and require it to be an existing directory.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, PathError> {
        let path = path.as_ref();
        let canonical = path.canonicalize().map_err(|error| match error.kind() {
            io::ErrorKind::NotFound => PathError::WorkspaceNotFound {
                path: path.display().to_string(),
            },
            _ => PathError::invalid(format!("cannot resolve {}: {error}", path.display())),
        })?;

        if !canonical.is_dir() {
            return Err(PathError::NotADirectory {
                path: path.display().to_string(),
            });
        }

        Ok(Self { path: canonical })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether an already-canonical path is the root or one of its descendants.
    pub fn contains(&self, canonical: &Path) -> bool {
        canonical.starts_with(&self.path)
    }

    /// The root as a validated path, e.g. to use it as a working directory.
    pub fn to_resolved(&self) -> ResolvedPath {
        ResolvedPath {
            path: self.path.clone(),
            exists: true,
        }
    }
}

/// A path proven to resolve inside a [`WorkspaceRoot`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPath {
    path: PathBuf,
    exists: bool,
}

impl ResolvedPath {
    pub fn as_path(&self) -> &Path {
        &self.path
    }

    /// False when the path was validated ahead of being created.
    pub fn exists(&self) -> bool {
        self.exists
    }

    pub fn into_path_buf(self) -> PathBuf {
        self.path
    }
}

impl AsRef<Path> for ResolvedPath {
    fn as_ref(&self) -> &Path {
        &self.path
    }
}

/// Validates candidate paths against one workspace root. Has no side effects.
#[derive(Debug, Clone)]
pub struct PathValidator {
    root: WorkspaceRoot,
    allow_hidden: bool,
}

impl PathValidator {
    pub fn new(root: WorkspaceRoot) -> Self {
        Self {
            root,
            allow_hidden: false,
        }
    }

    /// Permit components starting with `.` below the root.
    pub fn with_hidden_paths(mut self, allow: bool) -> Self {
        self.allow_hidden = allow;
        self
    }

    pub fn root(&self) -> &WorkspaceRoot {
        &self.root
    }

    /// Resolve `candidate` (absolute, or relative to the root) and prove it
    /// stays inside the root.
    pub fn validate(&self, candidate: &str) -> Result<ResolvedPath, PathError> {
        let result = self.resolve(candidate);
        if let Err(error) = &result {
            tracing::warn!(
                requested = candidate,
                root = %self.root.path.display(),
                code = error.code(),
                %error,
                "path rejected"
            );
        }
        result
    }

    /// Strict check for a directory that will be used as a subprocess cwd.
    ///
    /// Beyond containment, no component of `dir` below the root may be a
    /// symbolic link, even one that points back inside the root.
    pub fn validate_working_dir(&self, dir: &Path) -> Result<ResolvedPath, PathError> {
        let result = self.resolve_working_dir(dir);
        if let Err(error) = &result {
            tracing::warn!(
                requested = %dir.display(),
                root = %self.root.path.display(),
                code = error.code(),
                %error,
                "working directory rejected"
            );
        }
        result
    }

    /// Validate then read a UTF-8 file.
    pub async fn read_to_string(&self, candidate: &str) -> crate::Result<String> {
        let resolved = self.validate(candidate)?;
        Ok(tokio::fs::read_to_string(resolved.as_path()).await?)
    }

    /// Validate then list a directory. Names are sorted; hidden entries are
    /// omitted unless hidden paths are allowed.
    pub async fn list_dir(&self, candidate: &str) -> crate::Result<Vec<String>> {
        let resolved = self.validate(candidate)?;
        if !resolved.as_path().is_dir() {
            return Err(PathError::NotADirectory {
                path: candidate.to_string(),
            }
            .into());
        }

        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(resolved.as_path()).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !self.allow_hidden && name.starts_with('.') {
                continue;
            }
            names.push(name);
        }
        names.sort();
        Ok(names)
    }

    fn resolve(&self, candidate: &str) -> Result<ResolvedPath, PathError> {
        let decoded = decode_candidate(candidate)?;
        let requested = Path::new(&decoded);

        if requested
            .components()
            .any(|component| matches!(component, Component::ParentDir))
        {
            return Err(PathError::Traversal {
                path: candidate.to_string(),
            });
        }

        let joined = if requested.is_absolute() {
            requested.to_path_buf()
        } else {
            self.root.path.join(requested)
        };
        // Drops `.` segments so parent/file_name walk real components.
        let absolute: PathBuf = joined.components().collect();

        let resolved = match absolute.canonicalize() {
            Ok(canonical) => {
                self.ensure_contained(&canonical, candidate)?;
                ResolvedPath {
                    path: canonical,
                    exists: true,
                }
            }
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                self.resolve_missing(&absolute, candidate)?
            }
            Err(error) => {
                return Err(PathError::invalid(format!(
                    "cannot resolve {candidate}: {error}"
                )));
            }
        };

        self.ensure_visible(&resolved.path)?;
        Ok(resolved)
    }

    /// Resolve a path whose tail doesn't exist yet by canonicalising its
    /// deepest existing ancestor.
    fn resolve_missing(&self, absolute: &Path, candidate: &str) -> Result<ResolvedPath, PathError> {
        let mut existing = absolute;
        let mut suffix = Vec::new();

        loop {
            match existing.symlink_metadata() {
                Ok(_) => break,
                Err(error) if error.kind() == io::ErrorKind::NotFound => {
                    let name = existing
                        .file_name()
                        .ok_or_else(|| PathError::invalid(format!("cannot resolve {candidate}")))?;
                    suffix.push(name.to_os_string());
                    existing = existing
                        .parent()
                        .ok_or_else(|| PathError::invalid(format!("cannot resolve {candidate}")))?;
                }
                Err(error) => {
                    return Err(PathError::invalid(format!(
                        "cannot resolve {candidate}: {error}"
                    )));
                }
            }
        }

        // A dangling link can't be proven to stay inside the root.
        let canonical = existing
            .canonicalize()
            .map_err(|_| PathError::OutsideWorkspace {
                path: candidate.to_string(),
            })?;
        self.ensure_contained(&canonical, candidate)?;

        let mut path = canonical;
        for name in suffix.iter().rev() {
            if !matches!(Path::new(name).components().next(), Some(Component::Normal(_))) {
                return Err(PathError::Traversal {
                    path: candidate.to_string(),
                });
            }
            path.push(name);
        }

        Ok(ResolvedPath {
            path,
            exists: false,
        })
    }

    fn resolve_working_dir(&self, dir: &Path) -> Result<ResolvedPath, PathError> {
        let display = dir.display().to_string();
        let canonical = dir.canonicalize().map_err(|error| match error.kind() {
            io::ErrorKind::NotFound => PathError::WorkspaceNotFound {
                path: display.clone(),
            },
            _ => PathError::invalid(format!("cannot resolve {display}: {error}")),
        })?;

        if !canonical.is_dir() {
            return Err(PathError::NotADirectory { path: display });
        }
        self.ensure_contained(&canonical, &display)?;

        for ancestor in dir.ancestors() {
            if ancestor.as_os_str().is_empty() {
                break;
            }
            let resolved = ancestor
                .canonicalize()
                .map_err(|error| PathError::invalid(format!("cannot resolve {display}: {error}")))?;
            if resolved == self.root.path || !self.root.contains(&resolved) {
                break;
            }
            let is_symlink = ancestor
                .symlink_metadata()
                .map(|metadata| metadata.file_type().is_symlink())
                .map_err(|error| PathError::invalid(format!("cannot inspect {display}: {error}")))?;
            if is_symlink {
                return Err(PathError::Symlink {
                    path: ancestor.display().to_string(),
                });
            }
        }

        Ok(ResolvedPath {
            path: canonical,
            exists: true,
        })
    }

    fn ensure_contained(&self, canonical: &Path, candidate: &str) -> Result<(), PathError> {
        if self.root.contains(canonical) {
            Ok(())
        } else {
            Err(PathError::OutsideWorkspace {
                path: candidate.to_string(),
            })
        }
    }

    fn ensure_visible(&self, resolved: &Path) -> Result<(), PathError> {
        if self.allow_hidden {
            return Ok(());
        }
        let Ok(relative) = resolved.strip_prefix(&self.root.path) else {
            return Ok(());
        };
        for component in relative.components() {
            if let Component::Normal(name) = component {
                let name = name.to_string_lossy();
                if name.starts_with('.') {
                    return Err(PathError::HiddenComponent {
                        component: name.into_owned(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Percent-decode twice so double-encoded traversal is caught too.
fn decode_candidate(candidate: &str) -> Result<String, PathError> {
    if candidate.is_empty() {
        return Err(PathError::invalid("empty path"));
    }

    let mut decoded = candidate.to_string();
    for _ in 0..2 {
        decoded = urlencoding::decode(&decoded)
            .map_err(|_| PathError::invalid("path is not valid UTF-8 once decoded"))?
            .into_owned();
    }

    if decoded.contains('\0') {
        return Err(PathError::invalid("path contains a null byte"));
    }
    if decoded.is_empty() {
        return Err(PathError::invalid("empty path"));
    }
    Ok(decoded)
}

/// Validate `candidate` against `root` with default settings.
pub fn validate(root: &WorkspaceRoot, candidate: &str) -> Result<ResolvedPath, PathError> {
    PathValidator::new(root.clone()).validate(candidate)
}
