use crate::{Category, MemoryId};

/// Derive the stable id `<category>:<hex>` for a category and content pair.
///
/// The hex part is [`hash_content`]; both are part of the persisted-state contract, so
/// records written by other implementations of the same scheme keep their ids.
#[must_use]
pub fn build_id(category: Category, content: &str) -> MemoryId {
    MemoryId(format!("{}:{}", category.as_str(), hash_content(content)))
}

/// 31-multiplier rolling hash over UTF-16 code units, wrapped to a signed 32-bit value.
///
/// The absolute value is taken in 64 bits so `i32::MIN` renders as `80000000`.
/// Lower-case hex without padding.
#[must_use]
pub fn hash_content(content: &str) -> String {
    let mut hash: i32 = 0;
    for unit in content.encode_utf16() {
        hash = hash.wrapping_mul(31).wrapping_add(i32::from(unit));
    }
    format!("{:x}", i64::from(hash).abs())
}
