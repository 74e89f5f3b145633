pub mod extractor;
pub mod normalize;

pub use extractor::{extract, extract_fields, normalize_label, ExtractedRecord, ExtractedRelated, ExtractionIssue};
pub use normalize::{
    extract_unit, geocode_key, normalize_address, normalize_email, normalize_microchip,
    normalize_name, normalize_phone, normalize_unit,
};
