use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

static BATCH_HEADING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^STUDENT DETAILS FOR\s+(.+?)\s+BATCH\b").expect("Invalid regex: batch heading")
});

static LEADING_DIGITS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+").expect("Invalid regex: leading digits"));

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PersonalDetails {
    pub name: Option<String>,
    pub mobile: Option<String>,
    pub whatsapp: Option<String>,
    pub gender: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HometownDetails {
    pub city: Option<String>,
    pub district: Option<String>,
    pub state: Option<String>,
    pub country: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResidenceDetails {
    pub city: Option<String>,
    pub state: Option<String>,
    pub country: Option<String>,
    pub zip: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OtherDetails {
    pub year_of_birth: Option<i32>,
    pub education: Option<String>,
    pub profession: Option<String>,
    pub email: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReferrerDetails {
    pub name: Option<String>,
    pub mobile: Option<String>,
    pub student_id: Option<i64>,
    pub batch: Option<String>,
}

/// Registration fields recovered from a pasted WhatsApp message. Every field is
/// optional; a label that is absent or blank leaves its field as `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ParsedRegistration {
    pub batch: Option<String>,
    pub personal: PersonalDetails,
    pub hometown: HometownDetails,
    pub residence: ResidenceDetails,
    pub other: OtherDetails,
    pub referrer: ReferrerDetails,
}

impl ParsedRegistration {
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let checks: [(&'static str, bool); 20] = [
            ("batch", self.batch.is_some()),
            ("personal.name", self.personal.name.is_some()),
            ("personal.mobile", self.personal.mobile.is_some()),
            ("personal.whatsapp", self.personal.whatsapp.is_some()),
            ("personal.gender", self.personal.gender.is_some()),
            ("hometown.city", self.hometown.city.is_some()),
            ("hometown.district", self.hometown.district.is_some()),
            ("hometown.state", self.hometown.state.is_some()),
            ("hometown.country", self.hometown.country.is_some()),
            ("residence.city", self.residence.city.is_some()),
            ("residence.state", self.residence.state.is_some()),
            ("residence.country", self.residence.country.is_some()),
            ("residence.zip", self.residence.zip.is_some()),
            ("other.yearOfBirth", self.other.year_of_birth.is_some()),
            ("other.education", self.other.education.is_some()),
            ("other.profession", self.other.profession.is_some()),
            ("other.email", self.other.email.is_some()),
            ("referrer.name", self.referrer.name.is_some()),
            ("referrer.mobile", self.referrer.mobile.is_some()),
            ("referrer.studentId", self.referrer.student_id.is_some()),
        ];
        checks
            .iter()
            .filter(|(_, present)| !present)
            .map(|(name, _)| *name)
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Personal,
    Hometown,
    Residence,
    Other,
    Referrer,
}

#[derive(Default)]
struct Sections<'a> {
    batch: Option<String>,
    personal: Vec<&'a str>,
    hometown: Vec<&'a str>,
    residence: Vec<&'a str>,
    other: Vec<&'a str>,
    referrer: Vec<&'a str>,
}

impl<'a> Sections<'a> {
    fn lines_mut(&mut self, section: Section) -> &mut Vec<&'a str> {
        match section {
            Section::Personal => &mut self.personal,
            Section::Hometown => &mut self.hometown,
            Section::Residence => &mut self.residence,
            Section::Other => &mut self.other,
            Section::Referrer => &mut self.referrer,
        }
    }
}

pub fn parse_wa_text(text: &str) -> ParsedRegistration {
    let sections = split_sections(text);

    let personal = PersonalDetails {
        name: field(&sections.personal, "Full Name").map(title_case),
        mobile: field(&sections.personal, "Mobile#").and_then(digits_only),
        whatsapp: field(&sections.personal, "WhatsApp#").and_then(digits_only),
        gender: field(&sections.personal, "Gender").and_then(gender_code),
    };
    let hometown = HometownDetails {
        city: field(&sections.hometown, "Town/City").map(title_case),
        district: field(&sections.hometown, "District").map(title_case),
        state: field(&sections.hometown, "State").map(place_case),
        country: field(&sections.hometown, "Country").map(place_case),
    };
    let residence = ResidenceDetails {
        city: field(&sections.residence, "City").map(title_case),
        state: field(&sections.residence, "State").map(place_case),
        country: field(&sections.residence, "Country").map(place_case),
        zip: field(&sections.residence, "Pin/Zip").map(str::to_string),
    };
    let other = OtherDetails {
        year_of_birth: field(&sections.other, "Year of birth").and_then(leading_number),
        education: field(&sections.other, "Qualification").map(place_case),
        profession: field(&sections.other, "Profession").map(str::to_string),
        email: field(&sections.other, "Email Address").map(|v| v.to_lowercase()),
    };
    let referrer = ReferrerDetails {
        name: field(&sections.referrer, "Full Name").map(title_case),
        mobile: field(&sections.referrer, "Mobile#").and_then(digits_only),
        student_id: field(&sections.referrer, "Student ID#").and_then(|v| {
            if v.chars().all(|c| c.is_ascii_digit()) {
                v.parse::<i64>().ok()
            } else {
                None
            }
        }),
        batch: field(&sections.referrer, "Batch#").map(|v| v.to_uppercase()),
    };

    ParsedRegistration {
        batch: sections.batch,
        personal,
        hometown,
        residence,
        other,
        referrer,
    }
}

fn split_sections(text: &str) -> Sections<'_> {
    let mut out = Sections::default();
    // None means the previous section was closed by a marker line.
    let mut current: Option<Section> = Some(Section::Personal);
    let mut has_labeled = false;

    for raw in text.lines() {
        let t = raw.trim();
        if t.is_empty() {
            continue;
        }
        if let Some((section, batch)) = heading(t) {
            if batch.is_some() {
                out.batch = batch;
            }
            current = Some(section);
            has_labeled = false;
            continue;
        }
        if is_marker(t) {
            if has_labeled {
                current = None;
            }
            continue;
        }
        let Some(section) = current else {
            continue;
        };
        if t.contains(':') {
            has_labeled = true;
        }
        out.lines_mut(section).push(t);
    }
    out
}

fn heading(line: &str) -> Option<(Section, Option<String>)> {
    let norm = line
        .trim_matches('*')
        .trim()
        .trim_end_matches(':')
        .trim()
        .trim_matches('*')
        .trim();
    let upper = norm.to_uppercase();
    if upper.starts_with("STUDENT DETAILS FOR") {
        let batch = BATCH_HEADING
            .captures(norm)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim().to_string())
            .filter(|s| !s.is_empty());
        return Some((Section::Personal, batch));
    }
    let section = if upper.starts_with("HOMETOWN DETAILS") {
        Section::Hometown
    } else if upper.starts_with("CURRENT RESIDENCE") {
        Section::Residence
    } else if upper.starts_with("OTHER DETAILS") {
        Section::Other
    } else if upper.starts_with("REFERRED BY") {
        Section::Referrer
    } else {
        return None;
    };
    Some((section, None))
}

fn is_marker(line: &str) -> bool {
    line.chars().count() >= 3
        && line
            .chars()
            .all(|c| matches!(c, '\u{2014}' | '\u{2013}' | '\u{2500}' | '-' | '=' | '_'))
}

/// First value for `label` among the section's lines, trimmed; blank values count as absent.
fn field<'a>(lines: &[&'a str], label: &str) -> Option<&'a str> {
    lines.iter().find_map(|&line| {
        let (key, value) = line.split_once(':')?;
        if !key.trim().eq_ignore_ascii_case(label) {
            return None;
        }
        Some(value.trim()).filter(|v| !v.is_empty())
    })
}

pub fn title_case(value: &str) -> String {
    value
        .split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first
                    .to_uppercase()
                    .chain(chars.flat_map(|c| c.to_lowercase()))
                    .collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Short tokens are treated as abbreviations (`USA`, `UP`, `BE`).
pub fn place_case(value: &str) -> String {
    if value.chars().count() > 3 {
        title_case(value)
    } else {
        value.to_uppercase()
    }
}

pub fn digits_only(value: &str) -> Option<String> {
    let digits: String = value.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        None
    } else {
        Some(digits)
    }
}

fn gender_code(value: &str) -> Option<String> {
    let word = value.split_whitespace().next()?.to_lowercase();
    if word.starts_with('m') {
        Some("M".to_string())
    } else if word.starts_with('f') {
        Some("F".to_string())
    } else {
        None
    }
}

fn leading_number(value: &str) -> Option<i32> {
    LEADING_DIGITS.find(value)?.as_str().parse().ok()
}
