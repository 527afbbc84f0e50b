use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock, Mutex, OnceLock, PoisonError};

use tracing::info;

use crate::detection::DetectionLabel;
use crate::error::DetectorError;

static SHARED_REGISTRIES: LazyLock<Mutex<HashMap<PathBuf, Arc<ClassRegistry>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Ordered class labels, index-aligned with the model's score channels.
///
/// Loaded from disk at most once. Readers after initialization never lock;
/// the mutex only serializes the first load. [`ClassRegistry::shared`] hands
/// out one registry per path for the whole process, which is what every
/// `Detector` uses unless given its own.
pub struct ClassRegistry {
    path: PathBuf,
    labels: OnceLock<Box<[DetectionLabel]>>,
    init: Mutex<()>,
    loads: AtomicUsize,
}

impl ClassRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            labels: OnceLock::new(),
            init: Mutex::new(()),
            loads: AtomicUsize::new(0),
        }
    }

    /// The process-wide registry for `path`. Paths are compared as given, not canonicalized.
    pub fn shared(path: impl Into<PathBuf>) -> Arc<Self> {
        let path = path.into();
        let mut registries = SHARED_REGISTRIES.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            registries
                .entry(path)
                .or_insert_with_key(|path| Arc::new(Self::new(path.clone()))),
        )
    }

    /// A registry that is already populated and never touches disk.
    pub fn from_labels(labels: impl Into<Box<[DetectionLabel]>>) -> Self {
        let registry = Self::new(PathBuf::new());
        let _ = registry.labels.set(labels.into());
        registry
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_loaded(&self) -> bool {
        self.labels.get().is_some()
    }

    /// Number of times the backing file has been read.
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    /// The class list, loading it on first use.
    ///
    /// # Errors
    ///
    /// `ConfigLoad` if the file is missing, empty, or names a label outside the
    /// closed label set. Nothing is stored on failure.
    pub fn classes(&self) -> Result<&[DetectionLabel], DetectorError> {
        if let Some(labels) = self.labels.get() {
            return Ok(&labels[..]);
        }

        let _guard = self
            .init
            .lock()
            .map_err(|_| DetectorError::Processing("class registry lock poisoned".into()))?;

        if let Some(labels) = self.labels.get() {
            return Ok(&labels[..]);
        }

        self.loads.fetch_add(1, Ordering::SeqCst);
        let text = std::fs::read_to_string(&self.path).map_err(|e| self.config_error(e.to_string()))?;
        let labels = parse_class_list(&text).map_err(|reason| self.config_error(reason))?;

        info!(path = %self.path.display(), classes = labels.len(), "loaded class list");

        Ok(&self.labels.get_or_init(|| labels.into_boxed_slice())[..])
    }

    fn config_error(&self, reason: String) -> DetectorError {
        DetectorError::ConfigLoad {
            path: self.path.clone(),
            reason,
        }
    }
}

/// Parses a newline-delimited class list. Lines are trimmed and blank lines skipped.
pub fn parse_class_list(text: &str) -> Result<Vec<DetectionLabel>, String> {
    let labels = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| line.parse::<DetectionLabel>().map_err(|e| e.to_string()))
        .collect::<Result<Vec<_>, _>>()?;

    if labels.is_empty() {
        return Err("class list is empty".into());
    }

    Ok(labels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::{Arc, Barrier};

    fn class_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    fn all_labels_text() -> String {
        DetectionLabel::ALL
            .iter()
            .map(|l| l.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[test]
    fn parse_trims_and_skips_blank_lines() {
        let labels = parse_class_list("  FACE_MALE \n\n\tFEET_COVERED\r\n\n").unwrap();
        assert_eq!(labels, vec![DetectionLabel::FaceMale, DetectionLabel::FeetCovered]);
    }

    #[test]
    fn parse_rejects_unknown_label() {
        let err = parse_class_list("FACE_MALE\nHANDS_EXPOSED\n").unwrap_err();
        assert!(err.contains("HANDS_EXPOSED"));
    }

    #[test]
    fn parse_rejects_empty_list() {
        assert!(parse_class_list("\n  \n").is_err());
    }

    #[test]
    fn loads_file_in_order() {
        let file = class_file(&all_labels_text());
        let registry = ClassRegistry::new(file.path());

        assert!(!registry.is_loaded());
        let labels = registry.classes().unwrap();
        assert_eq!(labels, &DetectionLabel::ALL[..]);
        assert!(registry.is_loaded());
    }

    #[test]
    fn missing_file_is_config_error() {
        let registry = ClassRegistry::new("/nonexistent/classes");
        let err = registry.classes().unwrap_err();
        assert!(matches!(err, DetectorError::ConfigLoad { .. }));
        assert!(!registry.is_loaded());
    }

    #[test]
    fn file_is_read_once() {
        let file = class_file("FACE_FEMALE\nFACE_MALE\n");
        let registry = ClassRegistry::new(file.path());

        registry.classes().unwrap();
        // Contents changing on disk must not be observed after the first load
        std::fs::write(file.path(), "BELLY_EXPOSED\n").unwrap();
        let labels = registry.classes().unwrap();

        assert_eq!(labels, &[DetectionLabel::FaceFemale, DetectionLabel::FaceMale]);
        assert_eq!(registry.load_count(), 1);
    }

    #[test]
    fn concurrent_first_callers_see_identical_list() {
        let file = class_file(&all_labels_text());
        let registry = Arc::new(ClassRegistry::new(file.path()));
        let barrier = Arc::new(Barrier::new(8));

        let results: Vec<Vec<DetectionLabel>> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    registry.classes().unwrap().to_vec()
                })
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|t| t.join().unwrap())
            .collect();

        assert!(results.iter().all(|labels| labels.as_slice() == &DetectionLabel::ALL[..]));
        assert_eq!(registry.load_count(), 1);
    }

    #[test]
    fn shared_registry_is_one_per_path() {
        let file = class_file("FACE_FEMALE\nFACE_MALE\n");
        let other = class_file("BELLY_EXPOSED\n");

        let first = ClassRegistry::shared(file.path());
        let second = ClassRegistry::shared(file.path().to_path_buf());
        assert!(Arc::ptr_eq(&first, &second));
        assert!(!Arc::ptr_eq(&first, &ClassRegistry::shared(other.path())));

        first.classes().unwrap();
        assert_eq!(second.classes().unwrap(), &[DetectionLabel::FaceFemale, DetectionLabel::FaceMale]);
        assert_eq!(second.load_count(), 1);
    }

    #[test]
    fn preloaded_registry_skips_disk() {
        let registry = ClassRegistry::from_labels(vec![DetectionLabel::AnusCovered]);
        assert_eq!(registry.classes().unwrap(), &[DetectionLabel::AnusCovered]);
        assert_eq!(registry.load_count(), 0);
    }
}
