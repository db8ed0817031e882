//! Sheet source contract, JSON fixture loading, and the record normalizer.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset, Utc};
use ppb_core::{
    parse_amount, parse_int, parse_localized_date, CanonicalRecord, Category, ParseError,
    RecordField, Region,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "ppb-ingest";

/// Raw cell content as a spreadsheet API yields it: text, a primitive
/// number, or nothing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellValue {
    Text(String),
    Int(i64),
    Number(f64),
    Empty,
}

impl CellValue {
    pub fn as_text(&self) -> String {
        match self {
            CellValue::Text(text) => text.clone(),
            CellValue::Int(value) => value.to_string(),
            CellValue::Number(value) => value.to_string(),
            CellValue::Empty => String::new(),
        }
    }
}

/// One refreshed worksheet: a header row plus ordered cell rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sheet {
    pub title: String,
    pub headers: Vec<String>,
    pub rows: Vec<Vec<CellValue>>,
}

/// Supplier of the periodically refreshed sheets. The production connector
/// lives outside this system; the fixture implementation below stands in
/// for it.
pub trait SheetSource: Send + Sync {
    fn sheets(&self) -> Result<Vec<Sheet>>;
}

pub fn load_sheet(path: impl AsRef<Path>) -> Result<Sheet> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

/// Loads sheets from JSON files on disk.
pub struct FixtureSheetSource {
    paths: Vec<PathBuf>,
}

impl FixtureSheetSource {
    pub fn new(paths: Vec<PathBuf>) -> Self {
        Self { paths }
    }

    /// Every `*.json` file in the directory, in name order.
    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let mut paths: Vec<PathBuf> = fs::read_dir(dir)
            .with_context(|| format!("reading {}", dir.display()))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();
        Ok(Self::new(paths))
    }
}

impl SheetSource for FixtureSheetSource {
    fn sheets(&self) -> Result<Vec<Sheet>> {
        self.paths.iter().map(load_sheet).collect()
    }
}

/// Why a whole sheet was rejected. No rows from it are ingested; rows from
/// previously processed sheets stay as written.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SheetRejection {
    #[error("unrecognized header {label:?}")]
    UnknownHeader { label: String },
}

/// Why a single row was skipped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordRejection {
    #[error("unknown product category {0:?}")]
    UnknownCategory(String),
    #[error("unknown region {0:?}")]
    UnknownRegion(String),
    #[error("{field}: {source}")]
    Unparseable {
        field: &'static str,
        source: ParseError,
    },
    #[error("missing field {0}")]
    MissingField(&'static str),
    #[error("negative participant count {0}")]
    NegativeParticipants(i64),
}

/// Per-row result: a canonical record ready for upsert, or a typed
/// rejection the caller tallies.
#[derive(Debug, Clone, PartialEq)]
pub enum RowOutcome {
    Record(CanonicalRecord),
    Rejected(RecordRejection),
}

#[derive(Debug, Default)]
struct RecordDraft {
    contract_id: Option<String>,
    signature_date: Option<DateTime<Utc>>,
    buyer: Option<String>,
    seller: Option<String>,
    total_amount: Option<Decimal>,
    participants: Option<u32>,
    product_name: Option<Category>,
    product_details: Option<String>,
    product_hash: Option<String>,
    price: Option<Decimal>,
    region: Option<Region>,
}

fn require<T>(value: Option<T>, field: &'static str) -> Result<T, RecordRejection> {
    value.ok_or(RecordRejection::MissingField(field))
}

/// Turns validated sheet rows into canonical records. Pure except for the
/// configured local offset used for day-first dates.
pub struct Normalizer {
    tz: FixedOffset,
}

impl Normalizer {
    pub fn new(tz: FixedOffset) -> Self {
        Self { tz }
    }

    /// Resolves the header row once per sheet. Empty labels map to ignored
    /// columns; the first unknown non-empty label rejects the sheet.
    pub fn resolve_headers(&self, sheet: &Sheet) -> Result<Vec<Option<RecordField>>, SheetRejection> {
        sheet
            .headers
            .iter()
            .map(|label| {
                if label.trim().is_empty() {
                    return Ok(None);
                }
                match RecordField::for_header(label) {
                    Some(field) => Ok(Some(field)),
                    None => Err(SheetRejection::UnknownHeader {
                        label: label.clone(),
                    }),
                }
            })
            .collect()
    }

    /// Validates one row against the resolved header fields. Any single
    /// failing field discards the whole row.
    pub fn normalize_row(
        &self,
        fields: &[Option<RecordField>],
        row: &[CellValue],
    ) -> RowOutcome {
        match self.build_record(fields, row) {
            Ok(record) => RowOutcome::Record(record),
            Err(rejection) => RowOutcome::Rejected(rejection),
        }
    }

    fn build_record(
        &self,
        fields: &[Option<RecordField>],
        row: &[CellValue],
    ) -> Result<CanonicalRecord, RecordRejection> {
        let mut draft = RecordDraft::default();

        for (field, cell) in fields.iter().zip(row.iter()) {
            let Some(field) = field else { continue };
            let raw = cell.as_text();
            match field {
                RecordField::ContractId => draft.contract_id = Some(raw.trim().to_string()),
                RecordField::Buyer => draft.buyer = Some(raw.trim().to_string()),
                RecordField::Seller => draft.seller = Some(raw.trim().to_string()),
                RecordField::SignatureDate => {
                    draft.signature_date = Some(
                        parse_localized_date(&raw, self.tz).map_err(|source| {
                            RecordRejection::Unparseable {
                                field: field.name(),
                                source,
                            }
                        })?,
                    );
                }
                RecordField::TotalAmount => {
                    draft.total_amount =
                        Some(parse_amount(&raw).map_err(|source| RecordRejection::Unparseable {
                            field: field.name(),
                            source,
                        })?);
                }
                RecordField::Price => {
                    draft.price =
                        Some(parse_amount(&raw).map_err(|source| RecordRejection::Unparseable {
                            field: field.name(),
                            source,
                        })?);
                }
                RecordField::Participants => {
                    let parsed =
                        parse_int(&raw).map_err(|source| RecordRejection::Unparseable {
                            field: field.name(),
                            source,
                        })?;
                    draft.participants = Some(
                        u32::try_from(parsed)
                            .map_err(|_| RecordRejection::NegativeParticipants(parsed))?,
                    );
                }
                RecordField::ProductName => {
                    draft.product_name = Some(
                        Category::parse(&raw)
                            .ok_or_else(|| RecordRejection::UnknownCategory(raw.clone()))?,
                    );
                }
                RecordField::Region => {
                    draft.region = Some(
                        Region::parse(&raw)
                            .ok_or_else(|| RecordRejection::UnknownRegion(raw.clone()))?,
                    );
                }
                RecordField::ProductDetails => {
                    draft.product_hash = Some(CanonicalRecord::product_hash_for(&raw));
                    draft.product_details = Some(raw);
                }
            }
        }

        Ok(CanonicalRecord {
            contract_id: require(draft.contract_id, "contract_id")?,
            signature_date: require(draft.signature_date, "signature_date")?,
            buyer: require(draft.buyer, "buyer")?,
            seller: require(draft.seller, "seller")?,
            total_amount: require(draft.total_amount, "total_amount")?,
            participants: require(draft.participants, "participants")?,
            product_name: require(draft.product_name, "product_name")?,
            product_details: require(draft.product_details, "product_details")?,
            product_hash: require(draft.product_hash, "product_hash")?,
            price: require(draft.price, "price")?,
            region: require(draft.region, "region")?,
        })
    }

    /// Header validation plus per-row outcomes for a whole sheet.
    pub fn normalize_sheet(&self, sheet: &Sheet) -> Result<Vec<RowOutcome>, SheetRejection> {
        let fields = self.resolve_headers(sheet)?;
        Ok(sheet
            .rows
            .iter()
            .map(|row| self.normalize_row(&fields, row))
            .collect())
    }
}
