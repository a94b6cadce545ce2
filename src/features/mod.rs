//! Feature catalog: listing and coverage over `features/api` and `features/ui`.

#![allow(missing_docs)]

pub mod parser;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Serialize;

use crate::core::errors::{Result, TriageError};
use crate::features::parser::{FeatureFile, parse_feature_file};

/// A test area: one subdirectory of the features directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FeatureArea {
    Api,
    Ui,
}

impl FeatureArea {
    pub const ALL: [Self; 2] = [Self::Api, Self::Ui];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Api => "api",
            Self::Ui => "ui",
        }
    }
}

/// `feature_type` argument of `list_features`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FeatureFilter {
    Api,
    Ui,
    #[default]
    All,
}

impl FeatureFilter {
    #[must_use]
    pub fn areas(self) -> &'static [FeatureArea] {
        match self {
            Self::Api => &[FeatureArea::Api],
            Self::Ui => &[FeatureArea::Ui],
            Self::All => &FeatureArea::ALL,
        }
    }
}

impl FromStr for FeatureFilter {
    type Err = TriageError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "api" => Ok(Self::Api),
            "ui" => Ok(Self::Ui),
            "all" | "" => Ok(Self::All),
            other => Err(TriageError::InvalidArgument {
                details: format!("feature_type must be 'api', 'ui', or 'all' (got {other:?})"),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeatureListing {
    /// Keyed `<area>/<file stem>` so same-named files in different areas
    /// do not collide.
    pub features: BTreeMap<String, FeatureFile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CoverageFile {
    pub name: String,
    pub scenario_count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AreaCoverage {
    pub features: usize,
    pub scenarios: usize,
    pub files: Vec<CoverageFile>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CoverageReport {
    pub api: AreaCoverage,
    pub ui: AreaCoverage,
    pub total_features: usize,
    pub total_scenarios: usize,
}

/// Reads feature files under one project's features directory.
#[derive(Debug, Clone)]
pub struct FeatureCatalog {
    features_dir: PathBuf,
    project_root: PathBuf,
}

impl FeatureCatalog {
    #[must_use]
    pub fn new(features_dir: &Path, project_root: &Path) -> Self {
        Self {
            features_dir: features_dir.to_path_buf(),
            project_root: project_root.to_path_buf(),
        }
    }

    pub fn list(&self, filter: FeatureFilter) -> Result<FeatureListing> {
        let mut features = BTreeMap::new();
        for &area in filter.areas() {
            for path in self.feature_files(area)? {
                let parsed = parse_feature_file(&path, &self.project_root)?;
                features.insert(format!("{}/{}", area.as_str(), stem(&path)), parsed);
            }
        }
        Ok(FeatureListing { features })
    }

    pub fn coverage(&self) -> Result<CoverageReport> {
        let mut report = CoverageReport::default();
        for area in FeatureArea::ALL {
            let mut cov = AreaCoverage::default();
            for path in self.feature_files(area)? {
                let parsed = parse_feature_file(&path, &self.project_root)?;
                cov.features += 1;
                cov.scenarios += parsed.scenarios.len();
                cov.files.push(CoverageFile {
                    name: stem(&path),
                    scenario_count: parsed.scenarios.len(),
                });
            }
            report.total_features += cov.features;
            report.total_scenarios += cov.scenarios;
            match area {
                FeatureArea::Api => report.api = cov,
                FeatureArea::Ui => report.ui = cov,
            }
        }
        Ok(report)
    }

    /// `*.feature` files directly under the area directory, sorted by name.
    /// A missing area directory is empty, not an error.
    fn feature_files(&self, area: FeatureArea) -> Result<Vec<PathBuf>> {
        let dir = self.features_dir.join(area.as_str());
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(TriageError::io(&dir, err)),
        };
        let mut files: Vec<PathBuf> = entries
            .filter_map(std::result::Result::ok)
            .map(|e| e.path())
            .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "feature"))
            .collect();
        files.sort();
        Ok(files)
    }
}

fn stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}
