//! Project discovery and module resolution.
//!
//! A project is a directory tree rooted at a `bramble.toml`:
//!
//! ```toml
//! [module]
//! name = "example.com/proj"
//! ```
//!
//! Configuration files inside it are addressed by logical module names of
//! the form `<module name>/<relative path>`, where the path has no extension
//! and a directory stands for its `default.bramble`.

pub mod lockfile;

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub use lockfile::{LockFile, LockFileError, LockFileManager};

use crate::consts::{CONFIG_EXTENSION, DEFAULT_MODULE_FILE, LOCK_FILE, PROJECT_FILE};

#[derive(Debug, Error)]
pub enum ProjectError {
  #[error("couldn't find a bramble.toml file in this directory or any parent")]
  NotInProject,

  #[error("invalid project file {path}: {message}")]
  InvalidConfig { path: PathBuf, message: String },

  #[error("module {0:?} doesn't exist")]
  ModuleDoesNotExist(String),

  #[error("module {name:?} is not part of project {project:?}")]
  ForeignModule { name: String, project: String },

  #[error("{path} is not a module: {reason}")]
  NotAModule { path: PathBuf, reason: &'static str },

  #[error("function argument {0:?} has too many colons")]
  TooManyColons(String),

  #[error(transparent)]
  LockFile(#[from] LockFileError),

  #[error("failed to access {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectConfig {
  pub module: ModuleConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleConfig {
  pub name: String,
}

#[derive(Debug)]
pub struct Project {
  location: PathBuf,
  config: ProjectConfig,
  lockfile: Arc<LockFileManager>,
}

impl Project {
  /// Walk upward from `start` to the first directory holding `bramble.toml`.
  pub fn locate(start: &Path) -> Result<Self, ProjectError> {
    let start = dunce::canonicalize(start).map_err(|source| ProjectError::Io {
      path: start.to_path_buf(),
      source,
    })?;

    let mut dir = Some(start.as_path());
    while let Some(current) = dir {
      let candidate = current.join(PROJECT_FILE);
      if candidate.is_file() {
        debug!(project = %current.display(), "found project");
        return Self::load(current.to_path_buf());
      }
      dir = current.parent();
    }
    Err(ProjectError::NotInProject)
  }

  fn load(location: PathBuf) -> Result<Self, ProjectError> {
    let path = location.join(PROJECT_FILE);
    let contents = fs::read_to_string(&path).map_err(|source| ProjectError::Io {
      path: path.clone(),
      source,
    })?;
    let config: ProjectConfig = toml::from_str(&contents).map_err(|e| ProjectError::InvalidConfig {
      path: path.clone(),
      message: e.to_string(),
    })?;
    if config.module.name.is_empty() || config.module.name.ends_with('/') {
      return Err(ProjectError::InvalidConfig {
        path,
        message: format!("invalid module name {:?}", config.module.name),
      });
    }

    let lockfile = Arc::new(LockFileManager::new(location.join(LOCK_FILE)));
    Ok(Self {
      location,
      config,
      lockfile,
    })
  }

  /// Directory containing `bramble.toml`.
  pub fn location(&self) -> &Path {
    &self.location
  }

  /// The declared module name, e.g. `example.com/proj`.
  pub fn name(&self) -> &str {
    &self.config.module.name
  }

  pub fn lockfile(&self) -> &Arc<LockFileManager> {
    &self.lockfile
  }

  /// Translate a configuration file path into its module name.
  pub fn path_to_module_name(&self, path: &Path) -> Result<String, ProjectError> {
    if !path.to_string_lossy().ends_with(CONFIG_EXTENSION) {
      return Err(ProjectError::NotAModule {
        path: path.to_path_buf(),
        reason: "missing .bramble extension",
      });
    }
    if !path.is_file() {
      return Err(ProjectError::NotAModule {
        path: path.to_path_buf(),
        reason: "file does not exist",
      });
    }

    let rel = self.relative(path)?;
    let rel = if rel.file_name().is_some_and(|n| n == DEFAULT_MODULE_FILE) {
      rel.parent().map(Path::to_path_buf).unwrap_or_default()
    } else {
      rel.with_extension("")
    };
    Ok(self.module_name_for(&rel))
  }

  /// Resolve a module name to the file that defines it.
  ///
  /// A directory with a `default.bramble` wins over a sibling file with the
  /// same name plus extension.
  pub fn module_name_to_path(&self, name: &str) -> Result<PathBuf, ProjectError> {
    let rel = self.strip_module_prefix(name)?;

    let dir = self.location.join(rel);
    let default = dir.join(DEFAULT_MODULE_FILE);
    if dir.is_dir() && default.is_file() {
      return Ok(default);
    }

    if !rel.is_empty() {
      let file = self.location.join(format!("{rel}{CONFIG_EXTENSION}"));
      if file.is_file() {
        return Ok(file);
      }
    }

    Err(ProjectError::ModuleDoesNotExist(name.to_string()))
  }

  /// Split a `run` argument of the form `[path]:function` into a module name
  /// and function name. Paths are taken relative to `cwd`. Without a colon
  /// the whole argument is the function and the module is `cwd` itself.
  pub fn parse_module_function(&self, arg: &str, cwd: &Path) -> Result<(String, String), ProjectError> {
    let parts: Vec<&str> = arg.split(':').collect();
    let (path, function) = match parts.as_slice() {
      [function] => ("", *function),
      [path, function] => (*path, *function),
      _ => return Err(ProjectError::TooManyColons(arg.to_string())),
    };

    let module = if path.is_empty() {
      self.module_name_for(&self.relative(cwd)?)
    } else if path == self.name() || path.starts_with(&format!("{}/", self.name())) {
      path.to_string()
    } else {
      self.module_from_path(&cwd.join(path))?
    };

    Ok((module, function.to_string()))
  }

  fn module_from_path(&self, path: &Path) -> Result<String, ProjectError> {
    // support things like sub/main.bramble:fn
    if path.to_string_lossy().ends_with(CONFIG_EXTENSION) && path.is_file() {
      return self.path_to_module_name(path);
    }

    let with_ext = PathBuf::from(format!("{}{CONFIG_EXTENSION}", path.display()));
    if !with_ext.is_file() && !path.join(DEFAULT_MODULE_FILE).is_file() {
      return Err(ProjectError::ModuleDoesNotExist(path.display().to_string()));
    }
    Ok(self.module_name_for(&self.relative(path)?))
  }

  fn strip_module_prefix<'a>(&self, name: &'a str) -> Result<&'a str, ProjectError> {
    let foreign = || ProjectError::ForeignModule {
      name: name.to_string(),
      project: self.name().to_string(),
    };
    let rest = name.strip_prefix(self.name()).ok_or_else(foreign)?;
    if rest.is_empty() {
      return Ok(rest);
    }
    let rel = rest.strip_prefix('/').ok_or_else(foreign)?;
    // module names never leave the project directory
    if !Path::new(rel).components().all(|c| matches!(c, Component::Normal(_))) {
      return Err(foreign());
    }
    Ok(rel)
  }

  fn module_name_for(&self, rel: &Path) -> String {
    let rel = rel
      .components()
      .filter_map(|c| match c {
        Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
        _ => None,
      })
      .collect::<Vec<_>>()
      .join("/");
    if rel.is_empty() {
      self.name().to_string()
    } else {
      format!("{}/{}", self.name(), rel)
    }
  }

  /// `path` relative to the project root, lexically, after canonicalizing
  /// whatever prefix of it exists.
  fn relative(&self, path: &Path) -> Result<PathBuf, ProjectError> {
    let absolute = canonicalize_existing_prefix(path);
    absolute
      .strip_prefix(&self.location)
      .map(Path::to_path_buf)
      .map_err(|_| ProjectError::NotAModule {
        path: path.to_path_buf(),
        reason: "outside of the project",
      })
  }
}

fn canonicalize_existing_prefix(path: &Path) -> PathBuf {
  if let Ok(canonical) = dunce::canonicalize(path) {
    return canonical;
  }
  match (path.parent(), path.file_name()) {
    (Some(parent), Some(name)) => canonicalize_existing_prefix(parent).join(name),
    _ => path.to_path_buf(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  fn project(files: &[&str]) -> (TempDir, Project) {
    let temp = TempDir::new().unwrap();
    fs::write(
      temp.path().join(PROJECT_FILE),
      "[module]\nname = \"example.com/proj\"\n",
    )
    .unwrap();
    for file in files {
      let path = temp.path().join(file);
      fs::create_dir_all(path.parent().unwrap()).unwrap();
      fs::write(path, "").unwrap();
    }
    let project = Project::locate(temp.path()).unwrap();
    (temp, project)
  }

  #[test]
  fn locate_walks_upward() {
    let (temp, _) = project(&["a/b/c/default.bramble"]);
    let project = Project::locate(&temp.path().join("a/b/c")).unwrap();
    assert_eq!(project.name(), "example.com/proj");
    assert_eq!(project.location(), dunce::canonicalize(temp.path()).unwrap());
  }

  #[test]
  fn locate_outside_project_fails() {
    let temp = TempDir::new().unwrap();
    assert!(matches!(Project::locate(temp.path()), Err(ProjectError::NotInProject)));
  }

  #[test]
  fn invalid_project_file_is_reported() {
    let temp = TempDir::new().unwrap();
    fs::write(temp.path().join(PROJECT_FILE), "[module]\n").unwrap();
    assert!(matches!(
      Project::locate(temp.path()),
      Err(ProjectError::InvalidConfig { .. })
    ));
  }

  #[test]
  fn directory_default_wins_over_same_named_file() {
    let (temp, project) = project(&["sub/default.bramble", "sub.bramble"]);
    let resolved = project.module_name_to_path("example.com/proj/sub").unwrap();
    assert_eq!(
      resolved,
      dunce::canonicalize(temp.path()).unwrap().join("sub/default.bramble")
    );
  }

  #[test]
  fn same_named_file_used_without_directory_default() {
    let (temp, project) = project(&["sub/other.bramble", "sub.bramble"]);
    let resolved = project.module_name_to_path("example.com/proj/sub").unwrap();
    assert_eq!(resolved, dunce::canonicalize(temp.path()).unwrap().join("sub.bramble"));
  }

  #[test]
  fn root_module_resolves_to_root_default() {
    let (_temp, project) = project(&["default.bramble"]);
    let resolved = project.module_name_to_path("example.com/proj").unwrap();
    assert!(resolved.ends_with("default.bramble"));
  }

  #[test]
  fn missing_module_is_an_error() {
    let (_temp, project) = project(&[]);
    assert!(matches!(
      project.module_name_to_path("example.com/proj/nope"),
      Err(ProjectError::ModuleDoesNotExist(_))
    ));
    assert!(matches!(
      project.module_name_to_path("example.com/projection/x"),
      Err(ProjectError::ForeignModule { .. })
    ));
  }

  #[test]
  fn module_names_cannot_escape_the_project() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("proj");
    fs::create_dir_all(root.join("sub")).unwrap();
    fs::write(root.join(PROJECT_FILE), "[module]\nname = \"example.com/proj\"\n").unwrap();
    fs::write(root.join("sub/default.bramble"), "").unwrap();
    fs::write(temp.path().join("secret.bramble"), "").unwrap();
    let project = Project::locate(&root).unwrap();

    for name in [
      "example.com/proj/../secret",
      "example.com/proj/sub/../../secret",
      "example.com/proj/sub/../sub",
      "example.com/proj/./sub",
      "example.com/proj//etc/passwd",
    ] {
      assert!(
        matches!(project.module_name_to_path(name), Err(ProjectError::ForeignModule { .. })),
        "{name} resolved"
      );
    }
    assert!(project.module_name_to_path("example.com/proj/sub").is_ok());
  }

  #[test]
  fn path_to_module_name_strips_default_and_extension() {
    let (temp, project) = project(&["lib/default.bramble", "lib/util.bramble", "default.bramble"]);

    assert_eq!(
      project.path_to_module_name(&temp.path().join("lib/default.bramble")).unwrap(),
      "example.com/proj/lib"
    );
    assert_eq!(
      project.path_to_module_name(&temp.path().join("lib/util.bramble")).unwrap(),
      "example.com/proj/lib/util"
    );
    assert_eq!(
      project.path_to_module_name(&temp.path().join("default.bramble")).unwrap(),
      "example.com/proj"
    );
  }

  #[test]
  fn path_to_module_name_requires_existing_bramble_file() {
    let (temp, project) = project(&["notes.txt"]);
    assert!(project.path_to_module_name(&temp.path().join("notes.txt")).is_err());
    assert!(project.path_to_module_name(&temp.path().join("ghost.bramble")).is_err());
  }

  #[test]
  fn module_names_round_trip() {
    let (temp, project) = project(&["pkgs/tools.bramble"]);
    let name = project.path_to_module_name(&temp.path().join("pkgs/tools.bramble")).unwrap();
    let path = project.module_name_to_path(&name).unwrap();
    assert_eq!(path, dunce::canonicalize(temp.path().join("pkgs/tools.bramble")).unwrap());
  }

  #[test]
  fn parse_module_function_forms() {
    let (temp, project) = project(&["default.bramble", "sub/default.bramble", "lib/util.bramble"]);
    let root = temp.path();

    assert_eq!(
      project.parse_module_function("build", root).unwrap(),
      ("example.com/proj".to_string(), "build".to_string())
    );
    assert_eq!(
      project.parse_module_function(":build", &root.join("sub")).unwrap(),
      ("example.com/proj/sub".to_string(), "build".to_string())
    );
    assert_eq!(
      project.parse_module_function("lib/util:tool", root).unwrap(),
      ("example.com/proj/lib/util".to_string(), "tool".to_string())
    );
    assert_eq!(
      project.parse_module_function("lib/util.bramble:tool", root).unwrap(),
      ("example.com/proj/lib/util".to_string(), "tool".to_string())
    );
    assert_eq!(
      project.parse_module_function("example.com/proj/sub:x", root).unwrap(),
      ("example.com/proj/sub".to_string(), "x".to_string())
    );
    assert!(matches!(
      project.parse_module_function("a:b:c", root),
      Err(ProjectError::TooManyColons(_))
    ));
    assert!(project.parse_module_function("missing:x", root).is_err());
  }
}
