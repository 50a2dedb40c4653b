use chrono::NaiveDate;
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};

// ── Extracted record ──────────────────────────────────────────────────────────

/// Field name → value mapping produced by one extraction run.
///
/// Keys are fixed at construction (one per schema field, in schema order) and
/// every key starts out absent. Values are only ever filled in, never replaced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractedRecord {
    fields: Vec<(String, Option<String>)>,
}

impl ExtractedRecord {
    pub fn with_fields<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: names.into_iter().map(|n| (n.into(), None)).collect(),
        }
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(name, _)| name == field)
            .and_then(|(_, value)| value.as_deref())
    }

    pub fn contains_key(&self, field: &str) -> bool {
        self.fields.iter().any(|(name, _)| name == field)
    }

    pub fn is_set(&self, field: &str) -> bool {
        self.get(field).is_some()
    }

    /// Assign `value` unless the field already holds one.
    /// Returns whether the record changed; unknown fields are ignored.
    pub fn set_if_absent(&mut self, field: &str, value: impl Into<String>) -> bool {
        match self.fields.iter_mut().find(|(name, _)| name == field) {
            Some((_, slot @ None)) => {
                *slot = Some(value.into());
                true
            }
            _ => false,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v.as_deref()))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(n, _)| n.as_str())
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Number of fields that received a value.
    pub fn matched(&self) -> usize {
        self.fields.iter().filter(|(_, v)| v.is_some()).count()
    }
}

impl Serialize for ExtractedRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for (name, value) in &self.fields {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

/// Success body of a scan: the structured record plus the raw OCR text it came from.
#[derive(Debug, Clone, Serialize)]
pub struct ScanOutcome {
    pub data: ExtractedRecord,
    pub raw_text: String,
}

// ── Typed card view ───────────────────────────────────────────────────────────

macro_rules! card_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $label:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $label)] $variant),+
        }

        impl $name {
            /// Spelling used on the printed card.
            pub fn label(&self) -> &'static str {
                match self {
                    $($name::$variant => $label),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.label())
            }
        }

        impl std::str::FromStr for $name {
            type Err = String;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let wanted = s.split_whitespace().collect::<Vec<_>>().join(" ").to_uppercase();
                match wanted.as_str() {
                    $($label => Ok($name::$variant),)+
                    other => Err(format!("Unknown {}: '{other}'", stringify!($name))),
                }
            }
        }
    };
}

card_enum!(Gender {
    Male => "LAKI-LAKI",
    Female => "PEREMPUAN",
});

card_enum!(BloodType {
    A => "A",
    B => "B",
    AB => "AB",
    O => "O",
});

card_enum!(Religion {
    Islam => "ISLAM",
    Kristen => "KRISTEN",
    Katolik => "KATOLIK",
    Hindu => "HINDU",
    Budha => "BUDHA",
    Konghucu => "KONGHUCU",
});

card_enum!(MaritalStatus {
    BelumKawin => "BELUM KAWIN",
    Kawin => "KAWIN",
    CeraiHidup => "CERAI HIDUP",
    CeraiMati => "CERAI MATI",
});

card_enum!(
    /// WNI = Indonesian citizen, WNA = foreign national.
    Citizenship {
        Wni => "WNI",
        Wna => "WNA",
    }
);

/// "Berlaku Hingga" on the card.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Validity {
    Lifetime,
    Until(NaiveDate),
}

impl std::str::FromStr for Validity {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.split_whitespace().collect::<Vec<_>>().join(" ");
        if s.eq_ignore_ascii_case("SEUMUR HIDUP") {
            return Ok(Validity::Lifetime);
        }
        parse_card_date(&s)
            .map(Validity::Until)
            .ok_or_else(|| format!("Unknown validity: '{s}'"))
    }
}

/// Typed view over a record produced by the detailed schema.
///
/// Values that do not parse are dropped rather than reported; the raw strings
/// stay available on the record itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct KtpCard {
    pub nik: Option<String>,
    pub name: Option<String>,
    pub birth_place: Option<String>,
    pub birth_date: Option<NaiveDate>,
    pub gender: Option<Gender>,
    pub blood_type: Option<BloodType>,
    pub address: Option<String>,
    pub rt_rw: Option<String>,
    pub kel_desa: Option<String>,
    pub kecamatan: Option<String>,
    pub religion: Option<Religion>,
    pub marital_status: Option<MaritalStatus>,
    pub occupation: Option<String>,
    pub citizenship: Option<Citizenship>,
    pub validity: Option<Validity>,
}

impl From<&ExtractedRecord> for KtpCard {
    fn from(record: &ExtractedRecord) -> Self {
        let text = |field: &str| record.get(field).map(str::to_string);
        let (birth_place, birth_date) = record
            .get("tempat_tgl_lahir")
            .map(split_birth)
            .unwrap_or_default();

        KtpCard {
            nik: text("nik"),
            name: text("nama"),
            birth_place,
            birth_date,
            gender: parsed(record, "jenis_kelamin"),
            blood_type: parsed(record, "gol_darah"),
            address: text("alamat"),
            rt_rw: text("rt_rw"),
            kel_desa: text("kel_desa"),
            kecamatan: text("kecamatan"),
            religion: parsed(record, "agama"),
            marital_status: parsed(record, "status_perkawinan"),
            occupation: text("pekerjaan"),
            citizenship: parsed(record, "kewarganegaraan"),
            validity: parsed(record, "berlaku_hingga"),
        }
    }
}

fn parsed<T: std::str::FromStr>(record: &ExtractedRecord, field: &str) -> Option<T> {
    record.get(field).and_then(|v| v.parse().ok())
}

/// Split "BANDUNG, 17-08-1990" into place and date.
fn split_birth(value: &str) -> (Option<String>, Option<NaiveDate>) {
    let (place, date) = match value.rsplit_once(',') {
        Some((place, date)) => (place.trim(), parse_card_date(date)),
        None => (value.trim(), None),
    };
    let place = (!place.is_empty()).then(|| place.to_string());
    (place, date)
}

fn parse_card_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), "%d-%m-%Y").ok()
}
