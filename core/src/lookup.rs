//! Weighted code tables loaded from delimited files.
//!
//! File shape:
//!
//! ```text
//! / comment lines start with a slash
//! code,prob[,class]
//! K1A,0.25,urban
//! K2B,0.75,rural
//! ```
//!
//! Probabilities need not sum to 1; the sampler normalises them.

use crate::{
    error::{CohortError, CohortResult},
    rng::RandomSource,
    sampler::AliasSampler,
};
use std::{
    fs::File,
    io::{BufRead, BufReader},
    path::Path,
};

const COMMENT_MARKER: char = '/';

#[derive(Debug, Clone)]
pub struct Lookup {
    pub field_name: String,
    codes: Vec<String>,
    classes: Option<Vec<String>>,
    probs: Vec<f64>,
    sampler: AliasSampler,
}

impl Lookup {
    pub fn load(path: impl AsRef<Path>, field_name: &str, must_class: bool) -> CohortResult<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            CohortError::config(format!("cannot open lookup file {}: {e}", path.display()))
        })?;
        let lookup = Self::from_reader(BufReader::new(file), field_name, must_class)?;
        log::info!(
            "lookup: loaded {} codes for '{field_name}' from {}",
            lookup.len(),
            path.display()
        );
        Ok(lookup)
    }

    pub fn from_reader<R: BufRead>(
        reader: R,
        field_name: &str,
        must_class: bool,
    ) -> CohortResult<Self> {
        let mut header: Option<bool> = None;
        let mut codes = Vec::new();
        let mut probs = Vec::new();
        let mut classes = Vec::new();
        let mut last_line = 0;

        for (idx, line) in reader.lines().enumerate() {
            let line_no = idx + 1;
            last_line = line_no;
            let line = line.map_err(|e| {
                CohortError::lookup(line_no, format!("unreadable line: {e}"))
            })?;
            if line.starts_with(COMMENT_MARKER) || line.trim().is_empty() {
                continue;
            }
            let fields = split_fields(&line);

            let has_class = match header {
                None => {
                    let has_class = validate_header(&fields, line_no)?;
                    if must_class && !has_class {
                        return Err(CohortError::lookup(line_no, "class field is missing"));
                    }
                    header = Some(has_class);
                    continue;
                }
                Some(has_class) => has_class,
            };

            let expected = if has_class { 3 } else { 2 };
            if fields.len() != expected {
                return Err(CohortError::lookup(
                    line_no,
                    format!("expected {expected} fields, found {}", fields.len()),
                ));
            }
            let code = fields[0].trim();
            if code.is_empty() {
                return Err(CohortError::lookup(line_no, "missing code"));
            }
            let raw_prob = fields[1].trim();
            if raw_prob.is_empty() {
                return Err(CohortError::lookup(line_no, "missing prob"));
            }
            let prob: f64 = raw_prob.parse().map_err(|e| {
                CohortError::lookup(line_no, format!("invalid probability '{raw_prob}': {e}"))
            })?;
            if !prob.is_finite() || prob < 0.0 {
                return Err(CohortError::lookup(
                    line_no,
                    format!("probability must be non-negative, got {prob}"),
                ));
            }
            codes.push(code.to_string());
            probs.push(prob);
            if has_class {
                classes.push(fields[2].trim().to_string());
            }
        }

        let Some(has_class) = header else {
            return Err(CohortError::lookup(last_line.max(1), "empty lookup file"));
        };
        if codes.is_empty() {
            return Err(CohortError::lookup(last_line, "no data rows after header"));
        }
        let sampler = AliasSampler::new(&probs)?;
        Ok(Self {
            field_name: field_name.to_string(),
            codes,
            classes: has_class.then_some(classes),
            probs,
            sampler,
        })
    }

    /// Table from inline `(code, frequency)` pairs.
    pub fn from_frequencies(field_name: &str, entries: &[(String, u64)]) -> CohortResult<Self> {
        let freqs: Vec<u64> = entries.iter().map(|(_, f)| *f).collect();
        let sampler = AliasSampler::from_frequencies(&freqs)?;
        Ok(Self {
            field_name: field_name.to_string(),
            codes: entries.iter().map(|(c, _)| c.clone()).collect(),
            classes: None,
            probs: freqs.iter().map(|f| *f as f64).collect(),
            sampler,
        })
    }

    /// Draw one code, weighted by its probability column.
    pub fn draw<R: RandomSource + ?Sized>(&self, rng: &mut R) -> &str {
        &self.codes[self.sampler.sample(rng)]
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    pub fn codes(&self) -> &[String] {
        &self.codes
    }

    pub fn probs(&self) -> &[f64] {
        &self.probs
    }

    pub fn class_of(&self, index: usize) -> Option<&str> {
        self.classes
            .as_ref()
            .and_then(|c| c.get(index))
            .map(String::as_str)
    }
}

/// Returns whether the header carries a `class` column.
fn validate_header(fields: &[String], line_no: usize) -> CohortResult<bool> {
    if fields.len() < 2 || fields[0].trim() != "code" || fields[1].trim() != "prob" {
        return Err(CohortError::lookup(
            line_no,
            "required field names are missing; the first two fields must be named 'code' and 'prob'",
        ));
    }
    match fields.get(2).map(|f| f.trim()) {
        None => Ok(false),
        Some("class") if fields.len() == 3 => Ok(true),
        Some(other) => Err(CohortError::lookup(
            line_no,
            format!("unexpected column '{other}'; only an optional 'class' may follow 'prob'"),
        )),
    }
}

/// Split one comma-separated line, honouring double-quoted fields.
fn split_fields(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => fields.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    fields.push(current);
    fields
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rng::CohortRng;
    use std::io::Cursor;

    fn parse(text: &str, must_class: bool) -> CohortResult<Lookup> {
        Lookup::from_reader(Cursor::new(text), "postal_code", must_class)
    }

    fn line_of(err: CohortError) -> usize {
        match err {
            CohortError::LookupParse { line, .. } => line,
            other => panic!("expected LookupParse, got {other:?}"),
        }
    }

    #[test]
    fn parses_codes_and_skips_comments() {
        let lookup = parse("/ postal codes\ncode,prob\nK1A,1\n/ inline note\nK2B,3\n", false).unwrap();
        assert_eq!(lookup.codes(), &["K1A".to_string(), "K2B".to_string()]);
        assert_eq!(lookup.probs(), &[1.0, 3.0]);
        assert_eq!(lookup.class_of(0), None);
    }

    #[test]
    fn keeps_class_column_when_present() {
        let lookup = parse("code,prob,class\nA,0.5,urban\nB,0.5,rural\n", true).unwrap();
        assert_eq!(lookup.class_of(1), Some("rural"));
    }

    #[test]
    fn must_class_requires_class_header() {
        let err = parse("code,prob\nA,1\n", true).unwrap_err();
        assert_eq!(line_of(err), 1);
    }

    #[test]
    fn rejects_wrong_header_names() {
        assert_eq!(line_of(parse("code,weight\nA,1\n", false).unwrap_err()), 1);
        assert_eq!(line_of(parse("id,prob\nA,1\n", false).unwrap_err()), 1);
        assert_eq!(line_of(parse("/ c\nprob,code\nA,1\n", false).unwrap_err()), 2);
    }

    #[test]
    fn empty_probability_names_the_line() {
        let err = parse("code,prob\nA,0.2\nB,\n", false).unwrap_err();
        match err {
            CohortError::LookupParse { line, reason } => {
                assert_eq!(line, 3);
                assert!(reason.contains("missing prob"), "{reason}");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn rejects_empty_code_and_bad_numbers() {
        assert_eq!(line_of(parse("code,prob\n ,0.2\n", false).unwrap_err()), 2);
        assert_eq!(line_of(parse("code,prob\nA,abc\n", false).unwrap_err()), 2);
        assert_eq!(line_of(parse("code,prob\nA,-1\n", false).unwrap_err()), 2);
        assert_eq!(line_of(parse("code,prob\nA,1,extra\n", false).unwrap_err()), 2);
    }

    #[test]
    fn rejects_empty_source() {
        assert!(matches!(parse("", false), Err(CohortError::LookupParse { .. })));
        assert!(matches!(parse("/ only comments\n", false), Err(CohortError::LookupParse { .. })));
        assert!(matches!(parse("code,prob\n", false), Err(CohortError::LookupParse { .. })));
    }

    #[test]
    fn all_zero_probabilities_are_an_invalid_distribution() {
        assert!(matches!(
            parse("code,prob\nA,0\nB,0\n", false),
            Err(CohortError::InvalidDistribution(_))
        ));
    }

    #[test]
    fn draws_follow_weights() {
        let lookup = parse("code,prob\nrare,1\ncommon,9\n", false).unwrap();
        let mut rng = CohortRng::seed_from_u64(4);
        let rounds = 100_000;
        let common = (0..rounds).filter(|_| lookup.draw(&mut rng) == "common").count();
        let share = common as f64 / rounds as f64;
        assert!((share - 0.9).abs() < 0.01, "share {share:.4}");
    }

    #[test]
    fn quoted_fields_may_contain_commas() {
        let lookup = parse("code,prob\n\"A,1\",1\n\"B \"\"x\"\"\",1\n", false).unwrap();
        assert_eq!(lookup.codes(), &["A,1".to_string(), "B \"x\"".to_string()]);
    }

    #[test]
    fn loads_from_disk() {
        let path = std::env::temp_dir().join(format!("cohort-lookup-{}.csv", std::process::id()));
        std::fs::write(&path, "code,prob\nX,1\n").unwrap();
        let lookup = Lookup::load(&path, "region", false).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(lookup.field_name, "region");
        assert_eq!(lookup.len(), 1);
    }

    #[test]
    fn inline_frequencies_build_a_table() {
        let entries = vec![("a".to_string(), 0), ("b".to_string(), 5)];
        let lookup = Lookup::from_frequencies("zone", &entries).unwrap();
        let mut rng = CohortRng::seed_from_u64(1);
        assert!((0..1_000).all(|_| lookup.draw(&mut rng) == "b"));
    }

    #[test]
    fn invalid_utf8_reports_its_line() {
        let mut bytes = b"code,prob\nK1A,1\n".to_vec();
        bytes.extend_from_slice(b"K2\xff,2\n");
        let err = Lookup::from_reader(Cursor::new(bytes), "postal_code", false).unwrap_err();
        assert_eq!(line_of(err), 3);
    }
}
