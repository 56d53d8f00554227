//! Run configuration: the JSON file shape and the validated snapshot.
//!
//! RULE: `ConfigFile` is what users write. `CohortConfig` is what the
//! generator reads. Once validated, a `CohortConfig` is never mutated;
//! it is shared read-only (behind an `Arc`) by every generation task.

use crate::{
    clock::{format_date, parse_date, ObservationClock},
    dispatch::Category,
    error::{CohortError, CohortResult},
    lookup::Lookup,
    rng::RngMode,
    types::Timestamp,
};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

pub const DEFAULT_BUFFER_SIZE: usize = 100;
pub const DEFAULT_MAX_IN_FLIGHT: usize = 1024;
pub const DEFAULT_LOCATOR_NAME: &str = "postal_code";
/// Upper bound for a length-of-stay mean or sd, and for any single
/// drawn stay, in days.
pub const MAX_STAY_DAYS: i64 = 36_500;
/// Upper bound for an event-rate mean or sd, per follow-up year.
pub const MAX_EVENTS_PER_YEAR: f64 = 1_000.0;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Stats {
    #[serde(alias = "Mean")]
    pub mean: f64,
    #[serde(alias = "SD", alias = "Sd")]
    pub sd: f64,
}

impl Stats {
    pub fn new(mean: f64, sd: f64) -> Self {
        Self { mean, sd }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrugConfig {
    #[serde(alias = "DIN")]
    pub din: String,
    #[serde(alias = "Prob")]
    pub prob: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HospitalizationConfig {
    pub stay_length: Stats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiseaseConfig {
    pub name: String,
    pub prevalence_male: f64,
    pub prevalence_female: f64,
    pub hospital_rate: Stats,
    pub clinic_rate: Stats,
    /// Fill episodes per follow-up year. Absent: one episode per exposure.
    #[serde(default)]
    pub rx_rate: Option<Stats>,
    /// Code used on non-hospital (clinic) records.
    pub icd9: String,
    /// Code used on hospital records.
    pub icd10: String,
    #[serde(default)]
    pub dins: Vec<DrugConfig>,
    /// Overrides the top-level length-of-stay block for this disease.
    #[serde(default)]
    pub hospitalization: Option<HospitalizationConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PopulationConfig {
    pub migrant_prob: f64,
    pub cancel_prob: f64,
    pub database_start_date: String,
    pub earliest_birth_date: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocatorCode {
    pub code: String,
    pub freq: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LocatorConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub hosp_name: Option<String>,
    /// Lookup table path; relative paths resolve against the config file.
    #[serde(default)]
    pub file: Option<PathBuf>,
    #[serde(default)]
    pub codes: Vec<LocatorCode>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OptionsConfig {
    #[serde(default)]
    pub location_needed: bool,
}

fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

fn default_max_in_flight() -> usize {
    DEFAULT_MAX_IN_FLIGHT
}

/// The configuration file as written on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub seed: u64,
    pub n: usize,
    #[serde(default)]
    pub diseases: Vec<DiseaseConfig>,
    pub population: PopulationConfig,
    #[serde(default)]
    pub hospitalization: Option<HospitalizationConfig>,
    #[serde(default)]
    pub locator: Option<LocatorConfig>,
    #[serde(default)]
    pub options: OptionsConfig,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    #[serde(default)]
    pub rng_mode: RngMode,
}

impl ConfigFile {
    /// Read and parse a JSON config. Relative locator paths are
    /// rewritten against the file's directory.
    pub fn load(path: impl AsRef<Path>) -> CohortResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            CohortError::config(format!("cannot read {}: {e}", path.display()))
        })?;
        let mut file: ConfigFile = serde_json::from_str(&content).map_err(|e| {
            CohortError::config(format!("cannot parse {}: {e}", path.display()))
        })?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        if let Some(lookup) = file.locator.as_mut().and_then(|l| l.file.as_mut()) {
            if lookup.is_relative() {
                *lookup = base.join(&*lookup);
            }
        }
        Ok(file)
    }

    /// Config with hardcoded defaults for use in tests.
    pub fn default_test() -> Self {
        Self {
            version: "test".into(),
            seed: 42,
            n: 50,
            diseases: vec![DiseaseConfig {
                name: "diabetes".into(),
                prevalence_male: 0.3,
                prevalence_female: 0.25,
                hospital_rate: Stats::new(0.5, 0.5),
                clinic_rate: Stats::new(4.0, 1.5),
                rx_rate: None,
                icd9: "250".into(),
                icd10: "E11".into(),
                dins: vec![
                    DrugConfig { din: "02242974".into(), prob: 0.6 },
                    DrugConfig { din: "02099233".into(), prob: 0.3 },
                ],
                hospitalization: None,
            }],
            population: PopulationConfig {
                migrant_prob: 0.2,
                cancel_prob: 0.1,
                database_start_date: "1990-01-01".into(),
                earliest_birth_date: "1920-01-01".into(),
            },
            hospitalization: Some(HospitalizationConfig {
                stay_length: Stats::new(5.0, 2.0),
            }),
            locator: None,
            options: OptionsConfig::default(),
            buffer_size: 16,
            max_in_flight: 64,
            rng_mode: RngMode::PerMember,
        }
    }
}

/// One disease with its length-of-stay block resolved.
#[derive(Debug, Clone)]
pub struct Disease {
    pub name: String,
    pub prevalence_male: f64,
    pub prevalence_female: f64,
    pub hospital_rate: Stats,
    pub clinic_rate: Stats,
    pub rx_rate: Option<Stats>,
    pub hospital_code: String,
    pub clinic_code: String,
    pub dins: Vec<DrugConfig>,
    pub stay_length: Stats,
}

#[derive(Debug, Clone)]
pub struct Locator {
    pub lookup: Lookup,
    pub hosp_name: String,
}

/// Validated, immutable configuration snapshot.
#[derive(Debug, Clone)]
pub struct CohortConfig {
    pub(crate) seed: u64,
    pub(crate) n: usize,
    pub(crate) diseases: Vec<Disease>,
    pub(crate) migrant_prob: f64,
    pub(crate) cancel_prob: f64,
    pub(crate) database_start: Timestamp,
    pub(crate) earliest_birth: Timestamp,
    pub(crate) now: Timestamp,
    pub(crate) current_year: i32,
    pub(crate) locator: Option<Locator>,
    pub(crate) field_names: BTreeMap<Category, Vec<String>>,
    pub(crate) buffer_size: usize,
    pub(crate) max_in_flight: usize,
    pub(crate) rng_mode: RngMode,
}

impl CohortConfig {
    pub fn validate(file: ConfigFile, clock: ObservationClock) -> CohortResult<Self> {
        let now = clock.now();
        let current_year = clock.current_year()?;

        let database_start = parse_date(&file.population.database_start_date).ok_or_else(|| {
            CohortError::config(format!(
                "population.database_start_date '{}' is not a YYYY-MM-DD date",
                file.population.database_start_date
            ))
        })?;
        let earliest_birth = parse_date(&file.population.earliest_birth_date).ok_or_else(|| {
            CohortError::config(format!(
                "population.earliest_birth_date '{}' is not a YYYY-MM-DD date",
                file.population.earliest_birth_date
            ))
        })?;
        if database_start > now {
            return Err(CohortError::config(format!(
                "population.database_start_date is after today ({})",
                format_date(now)?
            )));
        }
        if earliest_birth > now {
            return Err(CohortError::config(format!(
                "population.earliest_birth_date is after today ({})",
                format_date(now)?
            )));
        }
        check_probability("population.migrant_prob", file.population.migrant_prob)?;
        check_probability("population.cancel_prob", file.population.cancel_prob)?;

        if file.diseases.is_empty() {
            return Err(CohortError::config(
                "configuration must include at least 1 disease entry",
            ));
        }
        let Some(hospitalization) = file.hospitalization else {
            return Err(CohortError::config(
                "configuration must include a hospitalization entry",
            ));
        };
        check_stay("hospitalization.stay_length", hospitalization.stay_length)?;

        let diseases = file
            .diseases
            .into_iter()
            .map(|d| resolve_disease(d, &hospitalization))
            .collect::<CohortResult<Vec<_>>>()?;

        if file.buffer_size == 0 {
            return Err(CohortError::config("buffer_size must be at least 1"));
        }
        if file.max_in_flight == 0 {
            return Err(CohortError::config("max_in_flight must be at least 1"));
        }

        let locator = if file.options.location_needed {
            Some(build_locator(file.locator)?)
        } else {
            None
        };

        let mut field_names = BTreeMap::new();
        for category in Category::ALL {
            let mut names: Vec<String> =
                category.base_fields().iter().map(|s| s.to_string()).collect();
            if let Some(loc) = &locator {
                match category {
                    Category::Person => names.push(loc.lookup.field_name.clone()),
                    Category::Hosp => names.push(loc.hosp_name.clone()),
                    Category::Clinic | Category::Rx => {}
                }
            }
            field_names.insert(category, names);
        }

        log::info!(
            "config: validated version='{}' n={} diseases={} location={} rng_mode={:?}",
            file.version,
            file.n,
            diseases.len(),
            locator.is_some(),
            file.rng_mode
        );

        Ok(Self {
            seed: file.seed,
            n: file.n,
            diseases,
            migrant_prob: file.population.migrant_prob,
            cancel_prob: file.population.cancel_prob,
            database_start,
            earliest_birth,
            now,
            current_year,
            locator,
            field_names,
            buffer_size: file.buffer_size,
            max_in_flight: file.max_in_flight,
            rng_mode: file.rng_mode,
        })
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn n(&self) -> usize {
        self.n
    }

    pub fn now(&self) -> Timestamp {
        self.now
    }

    pub fn diseases(&self) -> &[Disease] {
        &self.diseases
    }

    pub fn locator(&self) -> Option<&Locator> {
        self.locator.as_ref()
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    pub fn rng_mode(&self) -> RngMode {
        self.rng_mode
    }

    /// Header row for a category's output.
    pub fn field_names(&self, category: Category) -> &[String] {
        self.field_names
            .get(&category)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

fn resolve_disease(d: DiseaseConfig, global: &HospitalizationConfig) -> CohortResult<Disease> {
    let ctx = |field: &str| format!("disease '{}': {field}", d.name);
    check_probability(&ctx("prevalence_male"), d.prevalence_male)?;
    check_probability(&ctx("prevalence_female"), d.prevalence_female)?;
    check_rate(&ctx("hospital_rate"), d.hospital_rate)?;
    check_rate(&ctx("clinic_rate"), d.clinic_rate)?;
    if let Some(rx) = d.rx_rate {
        check_rate(&ctx("rx_rate"), rx)?;
    }
    for drug in &d.dins {
        if drug.din.trim().is_empty() {
            return Err(CohortError::config(ctx("drug with empty din")));
        }
        check_probability(&ctx(&format!("din {} prob", drug.din)), drug.prob)?;
    }
    let stay_length = d
        .hospitalization
        .as_ref()
        .unwrap_or(global)
        .stay_length;
    check_stay(&ctx("hospitalization.stay_length"), stay_length)?;

    Ok(Disease {
        name: d.name,
        prevalence_male: d.prevalence_male,
        prevalence_female: d.prevalence_female,
        hospital_rate: d.hospital_rate,
        clinic_rate: d.clinic_rate,
        rx_rate: d.rx_rate,
        hospital_code: d.icd10,
        clinic_code: d.icd9,
        dins: d.dins,
        stay_length,
    })
}

fn build_locator(config: Option<LocatorConfig>) -> CohortResult<Locator> {
    let Some(config) = config else {
        return Err(CohortError::config(
            "location_needed is set so the configuration must include a locator entry",
        ));
    };
    let name = if config.name.trim().is_empty() {
        DEFAULT_LOCATOR_NAME.to_string()
    } else {
        config.name.trim().to_string()
    };
    let hosp_name = config
        .hosp_name
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| format!("hosp_{name}"));

    let lookup = match (&config.file, config.codes.is_empty()) {
        (Some(path), _) => Lookup::load(path, &name, false)?,
        (None, false) => {
            let entries: Vec<(String, u64)> = config
                .codes
                .iter()
                .map(|c| (c.code.clone(), c.freq))
                .collect();
            Lookup::from_frequencies(&name, &entries).map_err(|e| {
                CohortError::config(format!("error parsing locator codes: {e}"))
            })?
        }
        (None, true) => {
            return Err(CohortError::config(
                "location_needed is set so the locator must name a file or list at least one code",
            ))
        }
    };
    Ok(Locator { lookup, hosp_name })
}

fn check_probability(field: &str, p: f64) -> CohortResult<()> {
    if (0.0..=1.0).contains(&p) {
        Ok(())
    } else {
        Err(CohortError::config(format!(
            "{field} must be a probability in [0, 1], got {p}"
        )))
    }
}

fn check_stats(field: &str, stats: Stats, limit: f64) -> CohortResult<()> {
    if !stats.mean.is_finite() || !stats.sd.is_finite() || stats.sd < 0.0 {
        return Err(CohortError::config(format!(
            "{field} needs a finite mean and a non-negative sd, got mean={} sd={}",
            stats.mean, stats.sd
        )));
    }
    if stats.mean.abs() > limit || stats.sd > limit {
        return Err(CohortError::config(format!(
            "{field} mean and sd must lie within {limit}, got mean={} sd={}",
            stats.mean, stats.sd
        )));
    }
    Ok(())
}

fn check_rate(field: &str, stats: Stats) -> CohortResult<()> {
    check_stats(field, stats, MAX_EVENTS_PER_YEAR)
}

fn check_stay(field: &str, stats: Stats) -> CohortResult<()> {
    check_stats(field, stats, MAX_STAY_DAYS as f64)
}
