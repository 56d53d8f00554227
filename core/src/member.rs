//! Cohort members and the events derived from their disease exposures.

use crate::{
    clock::format_date,
    dispatch::{Category, Record},
    error::CohortResult,
    types::{MemberId, Timestamp},
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Sex {
    Male = 0,
    Female = 1,
}

impl Sex {
    pub fn code(&self) -> u8 {
        *self as u8
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CohortMember {
    pub id: MemberId,
    pub sex: Sex,
    pub dob: Timestamp,
    /// Current year minus birth year; month and day are ignored.
    pub age: i32,
    pub registration_date: Timestamp,
    pub cancel_date: Timestamp,
    pub locator: Option<String>,
}

impl CohortMember {
    pub fn to_record(&self) -> CohortResult<Record> {
        let mut fields = vec![
            self.id.to_string(),
            self.sex.code().to_string(),
            format_date(self.dob)?,
            self.age.to_string(),
            format_date(self.registration_date)?,
            format_date(self.cancel_date)?,
        ];
        fields.extend(self.locator.clone());
        Ok(Record::new(Category::Person, fields))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncounterKind {
    Hospital,
    Clinic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Encounter {
    pub member_id: MemberId,
    pub kind: EncounterKind,
    pub start_date: Timestamp,
    /// Discharge date; hospital encounters only.
    pub end_date: Option<Timestamp>,
    pub diagnosis: String,
    /// Hospital location when the locator is enabled.
    pub locator: Option<String>,
}

impl Encounter {
    pub fn to_record(&self) -> CohortResult<Record> {
        let mut fields = vec![self.member_id.to_string(), format_date(self.start_date)?];
        let record = match self.kind {
            EncounterKind::Hospital => {
                fields.push(format_date(self.end_date.unwrap_or(self.start_date))?);
                fields.push(self.diagnosis.clone());
                fields.extend(self.locator.clone());
                Record::new(Category::Hosp, fields)
            }
            EncounterKind::Clinic => {
                fields.push(self.diagnosis.clone());
                Record::new(Category::Clinic, fields)
            }
        };
        Ok(record)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prescription {
    pub member_id: MemberId,
    pub fill_date: Timestamp,
    pub din: String,
}

impl Prescription {
    pub fn to_record(&self) -> CohortResult<Record> {
        Ok(Record::new(
            Category::Rx,
            vec![
                self.member_id.to_string(),
                format_date(self.fill_date)?,
                self.din.clone(),
            ],
        ))
    }
}

/// One (member, disease) pair whose prevalence trial succeeded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiseaseExposure {
    pub disease: String,
    pub incidence_date: Timestamp,
    /// Whole years from incidence to end of observation.
    pub follow_up_years: i64,
    pub encounters: Vec<Encounter>,
    pub prescriptions: Vec<Prescription>,
}

impl DiseaseExposure {
    pub fn hospitalizations(&self) -> impl Iterator<Item = &Encounter> {
        self.encounters
            .iter()
            .filter(|e| e.kind == EncounterKind::Hospital)
    }

    pub fn clinic_visits(&self) -> impl Iterator<Item = &Encounter> {
        self.encounters
            .iter()
            .filter(|e| e.kind == EncounterKind::Clinic)
    }

    /// Hospital, then clinic, then prescription rows.
    pub fn to_records(&self) -> CohortResult<Vec<Record>> {
        self.hospitalizations()
            .chain(self.clinic_visits())
            .map(Encounter::to_record)
            .chain(self.prescriptions.iter().map(Prescription::to_record))
            .collect()
    }
}

/// A member and everything generated for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberTimeline {
    pub member: CohortMember,
    pub exposures: Vec<DiseaseExposure>,
}

impl MemberTimeline {
    /// Record tuples in emission order: the demographic row first, then
    /// each exposure's hospital, clinic and prescription rows.
    pub fn into_records(self) -> CohortResult<Vec<Record>> {
        let mut records = vec![self.member.to_record()?];
        for exposure in &self.exposures {
            records.extend(exposure.to_records()?);
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::parse_date;

    #[test]
    fn person_record_has_contract_fields() {
        let member = CohortMember {
            id: 1_000_001,
            sex: Sex::Female,
            dob: parse_date("1980-02-29").unwrap(),
            age: 44,
            registration_date: parse_date("1990-01-01").unwrap(),
            cancel_date: parse_date("2024-06-01").unwrap(),
            locator: Some("K1A".into()),
        };
        let record = member.to_record().unwrap();
        assert_eq!(record.category, Category::Person);
        assert_eq!(
            record.fields,
            vec!["1000001", "1", "1980-02-29", "44", "1990-01-01", "2024-06-01", "K1A"]
        );
    }

    #[test]
    fn encounter_records_route_by_kind() {
        let start = parse_date("2010-05-01").unwrap();
        let hosp = Encounter {
            member_id: 7,
            kind: EncounterKind::Hospital,
            start_date: start,
            end_date: Some(parse_date("2010-05-04").unwrap()),
            diagnosis: "E11".into(),
            locator: None,
        };
        let clinic = Encounter {
            kind: EncounterKind::Clinic,
            end_date: None,
            diagnosis: "250".into(),
            ..hosp.clone()
        };
        assert_eq!(
            hosp.to_record().unwrap(),
            Record::new(
                Category::Hosp,
                vec!["7".into(), "2010-05-01".into(), "2010-05-04".into(), "E11".into()]
            )
        );
        assert_eq!(
            clinic.to_record().unwrap(),
            Record::new(Category::Clinic, vec!["7".into(), "2010-05-01".into(), "250".into()])
        );
    }

    #[test]
    fn unrepresentable_discharge_date_is_an_error() {
        let hosp = Encounter {
            member_id: 7,
            kind: EncounterKind::Hospital,
            start_date: parse_date("2010-05-01").unwrap(),
            end_date: Some(i64::MAX),
            diagnosis: "E11".into(),
            locator: None,
        };
        assert!(matches!(
            hosp.to_record(),
            Err(crate::error::CohortError::DateOutOfRange(i64::MAX))
        ));
    }
}
