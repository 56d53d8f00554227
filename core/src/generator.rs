//! Cohort generator: turns the configuration plus a random stream into
//! one member's full event timeline.
//!
//! Draw order per member (fixed; changing it changes every output):
//!   1. sex, date of birth, age
//!   2. registration date (migrants only), date-of-birth clamp
//!   3. end of observation (cancellations only)
//!   4. person locator, if enabled
//!   5. per disease: prevalence trial, incidence date, hospital stays,
//!      clinic visits, prescription fills

use crate::{
    clock::{add_days, year_of},
    config::{CohortConfig, Disease, Stats, MAX_STAY_DAYS},
    error::{CohortError, CohortResult},
    member::{
        CohortMember, DiseaseExposure, Encounter, EncounterKind, MemberTimeline, Prescription,
        Sex,
    },
    rng::RandomSource,
    types::{MemberId, Timestamp, DAYS_PER_YEAR, SECONDS_PER_DAY},
};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct CohortGenerator {
    config: Arc<CohortConfig>,
}

impl CohortGenerator {
    pub fn new(config: Arc<CohortConfig>) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CohortConfig {
        &self.config
    }

    /// Generate one member with every exposure. Pure apart from the
    /// draws taken from `rng`.
    pub fn generate<R: RandomSource + ?Sized>(
        &self,
        id: MemberId,
        rng: &mut R,
    ) -> CohortResult<MemberTimeline> {
        let member = self.generate_person(id, rng)?;
        let mut exposures = Vec::new();
        for disease in &self.config.diseases {
            exposures.extend(self.expose(&member, disease, rng)?);
        }
        log::trace!(
            "cohort: member {id} generated with {} exposures",
            exposures.len()
        );
        Ok(MemberTimeline { member, exposures })
    }

    /// Steps 1 to 4: the demographic part of a member.
    pub fn generate_person<R: RandomSource + ?Sized>(
        &self,
        id: MemberId,
        rng: &mut R,
    ) -> CohortResult<CohortMember> {
        let cfg = &*self.config;
        let now = cfg.now;

        let sex = if rng.uniform_int(0, 1) == 0 {
            Sex::Male
        } else {
            Sex::Female
        };
        let mut dob = rng.range_date(cfg.earliest_birth, now);
        let age = cfg.current_year - year_of(dob)?;

        let registration_date = if rng.chance(cfg.migrant_prob) {
            rng.range_date(cfg.database_start, now)
        } else {
            cfg.database_start
        };
        if dob > registration_date {
            dob = registration_date;
        }
        let cancel_date = if rng.chance(cfg.cancel_prob) {
            rng.range_date(registration_date, now)
        } else {
            now
        };
        let locator = cfg
            .locator
            .as_ref()
            .map(|l| l.lookup.draw(rng).to_string());

        Ok(CohortMember {
            id,
            sex,
            dob,
            age,
            registration_date,
            cancel_date,
            locator,
        })
    }

    /// Step 5 for one disease. `None` when the prevalence trial fails.
    pub fn expose<R: RandomSource + ?Sized>(
        &self,
        member: &CohortMember,
        disease: &Disease,
        rng: &mut R,
    ) -> CohortResult<Option<DiseaseExposure>> {
        let prevalence = match member.sex {
            Sex::Male => disease.prevalence_male,
            Sex::Female => disease.prevalence_female,
        };
        if !rng.chance(prevalence) {
            return Ok(None);
        }

        let incidence_date = rng.range_date(member.registration_date, member.cancel_date);
        let follow_up_years = (member.cancel_date - incidence_date) / SECONDS_PER_DAY / DAYS_PER_YEAR;
        let mut encounters = Vec::new();

        for _ in 0..event_count(rng, disease.hospital_rate, follow_up_years) {
            let start_date = rng.range_date(incidence_date, member.cancel_date);
            // Truncated toward zero, then held inside [0, MAX_STAY_DAYS] so
            // discharge never precedes admission.
            let stay_days = (rng.normal(disease.stay_length.mean, disease.stay_length.sd) as i64)
                .clamp(0, MAX_STAY_DAYS);
            let end_date =
                add_days(start_date, stay_days).ok_or(CohortError::DateOutOfRange(start_date))?;
            let locator = self
                .config
                .locator
                .as_ref()
                .map(|l| l.lookup.draw(rng).to_string());
            encounters.push(Encounter {
                member_id: member.id,
                kind: EncounterKind::Hospital,
                start_date,
                end_date: Some(end_date),
                diagnosis: disease.hospital_code.clone(),
                locator,
            });
        }

        for _ in 0..event_count(rng, disease.clinic_rate, follow_up_years) {
            encounters.push(Encounter {
                member_id: member.id,
                kind: EncounterKind::Clinic,
                start_date: rng.range_date(incidence_date, member.cancel_date),
                end_date: None,
                diagnosis: disease.clinic_code.clone(),
                locator: None,
            });
        }

        let fills = match disease.rx_rate {
            Some(rate) => event_count(rng, rate, follow_up_years),
            None => 1,
        };
        let mut prescriptions = Vec::new();
        for _ in 0..fills {
            let fill_date = rng.range_date(incidence_date, member.cancel_date);
            prescriptions.extend(fill(member.id, fill_date, disease, rng));
        }

        Ok(Some(DiseaseExposure {
            disease: disease.name.clone(),
            incidence_date,
            follow_up_years,
            encounters,
            prescriptions,
        }))
    }
}

/// `floor(normal(mean, sd)) * follow_up_years`. A negative draw gives a
/// negative count, which callers iterate zero times.
fn event_count<R: RandomSource + ?Sized>(rng: &mut R, rate: Stats, follow_up_years: i64) -> i64 {
    let per_year = rng.normal(rate.mean, rate.sd).floor() as i64;
    per_year.saturating_mul(follow_up_years)
}

/// One independent trial per formulary drug, all on the same fill date.
fn fill<R: RandomSource + ?Sized>(
    member_id: MemberId,
    fill_date: Timestamp,
    disease: &Disease,
    rng: &mut R,
) -> Vec<Prescription> {
    disease
        .dins
        .iter()
        .filter(|drug| rng.chance(drug.prob))
        .map(|drug| Prescription {
            member_id,
            fill_date,
            din: drug.din.clone(),
        })
        .collect()
}
