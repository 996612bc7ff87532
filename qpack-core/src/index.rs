//! Conversions between absolute, relative and post-base indices, and the
//! Required Insert Count encoding (RFC 9204 Sections 3.2.4 to 3.2.6 and
//! 4.5.1.1).
//!
//! Functions converting wire values to absolute indices return `None`
//! when the wire value is out of range; that is always a peer error.
//! Functions converting absolute indices to wire values take values
//! computed locally and treat out-of-range input as a programming error.

/// Converts an absolute index to a relative index on the encoder stream.
pub fn absolute_to_encoder_stream_relative(absolute_index: u64, inserted_entry_count: u64) -> u64 {
    debug_assert!(absolute_index < inserted_entry_count);
    inserted_entry_count - absolute_index - 1
}

/// Converts an absolute index to a relative index in a header block.
pub fn absolute_to_request_stream_relative(absolute_index: u64, base: u64) -> u64 {
    debug_assert!(absolute_index < base);
    base - absolute_index - 1
}

/// Converts a relative index received on the encoder stream.
pub fn encoder_stream_relative_to_absolute(
    relative_index: u64,
    inserted_entry_count: u64,
) -> Option<u64> {
    if relative_index >= inserted_entry_count {
        return None;
    }
    Some(inserted_entry_count - relative_index - 1)
}

/// Converts a relative index received in a header block.
pub fn request_stream_relative_to_absolute(relative_index: u64, base: u64) -> Option<u64> {
    if relative_index >= base {
        return None;
    }
    Some(base - relative_index - 1)
}

/// Converts a post-base index received in a header block.
///
/// The result must be strictly below `u64::MAX` so that `index + 1`
/// (the insert count it implies) is representable.
pub fn post_base_to_absolute(post_base_index: u64, base: u64) -> Option<u64> {
    if post_base_index >= u64::MAX - base {
        return None;
    }
    Some(base + post_base_index)
}

/// Encodes Required Insert Count for the header block prefix.
///
/// `max_entries` is the dynamic table capacity divided by 32; it must be
/// non-zero whenever `required_insert_count` is.
pub fn encode_required_insert_count(required_insert_count: u64, max_entries: u64) -> u64 {
    if required_insert_count == 0 {
        return 0;
    }
    debug_assert!(max_entries > 0);
    required_insert_count % (2 * max_entries) + 1
}

/// Decodes the Required Insert Count from its prefix encoding, given the
/// number of insertions the decoder has seen so far.
///
/// Returns `None` if the encoded value cannot correspond to any valid
/// Required Insert Count.
pub fn decode_required_insert_count(
    encoded_required_insert_count: u64,
    max_entries: u64,
    total_number_of_inserts: u64,
) -> Option<u64> {
    if encoded_required_insert_count == 0 {
        return Some(0);
    }

    // max_entries is a u64 divided by 32, so none of the arithmetic on
    // 2 * max_entries below can overflow.
    debug_assert!(max_entries <= u64::MAX / 32);
    let full_range = 2 * max_entries;
    if encoded_required_insert_count > full_range {
        return None;
    }

    let mut required_insert_count = encoded_required_insert_count - 1;
    let mut current_wrapped = total_number_of_inserts % full_range;

    if current_wrapped >= required_insert_count + max_entries {
        // Required Insert Count wrapped around one extra time.
        required_insert_count += full_range;
    } else if current_wrapped + max_entries < required_insert_count {
        // Decoder wrapped around one extra time.
        current_wrapped += full_range;
    }

    required_insert_count = required_insert_count.checked_add(total_number_of_inserts)?;

    // Also rules out zero, which is encoded differently.
    if current_wrapped >= required_insert_count {
        return None;
    }
    Some(required_insert_count - current_wrapped)
}
