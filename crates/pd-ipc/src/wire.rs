//! Field readers and writers shared by the typed payload codecs.

use pd_core::BrowserError;
use pd_core::BrowserResult;
use pd_core::NetError;
use pd_core::NetStatus;

pub(crate) fn put_bool(out: &mut Vec<u8>, value: bool) {
    out.push(u8::from(value));
}

pub(crate) fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_be_bytes());
}

pub(crate) fn put_u64(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_be_bytes());
}

pub(crate) fn put_i64(out: &mut Vec<u8>, value: i64) {
    out.extend_from_slice(&value.to_be_bytes());
}

pub(crate) fn put_status(out: &mut Vec<u8>, status: NetStatus) {
    put_u32(out, pd_core::status_to_wire(status));
}

pub(crate) fn put_error(out: &mut Vec<u8>, error: NetError) {
    put_u32(out, error.wire_code());
}

pub(crate) fn put_optional_u64(out: &mut Vec<u8>, value: Option<u64>) {
    match value {
        Some(value) => {
            put_bool(out, true);
            put_u64(out, value);
        }
        None => put_bool(out, false),
    }
}

pub(crate) fn put_bytes(out: &mut Vec<u8>, field: &str, bytes: &[u8]) -> BrowserResult<()> {
    let len = u32::try_from(bytes.len()).map_err(|_| {
        BrowserError::new(
            "ipc.message_field_too_large",
            format!(
                "field `{field}` exceeds 32-bit size limit ({} bytes)",
                bytes.len()
            ),
        )
    })?;
    put_u32(out, len);
    out.extend_from_slice(bytes);
    Ok(())
}

pub(crate) fn put_string(out: &mut Vec<u8>, field: &str, value: &str) -> BrowserResult<()> {
    put_bytes(out, field, value.as_bytes())
}

pub(crate) fn read_u8(payload: &[u8], offset: &mut usize, field: &str) -> BrowserResult<u8> {
    if *offset >= payload.len() {
        return Err(BrowserError::new(
            "ipc.message_truncated",
            format!("missing `{field}` in typed IPC payload"),
        ));
    }

    let value = payload[*offset];
    *offset += 1;
    Ok(value)
}

pub(crate) fn read_bool(payload: &[u8], offset: &mut usize, field: &str) -> BrowserResult<bool> {
    match read_u8(payload, offset, field)? {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(BrowserError::new(
            "ipc.message_field_invalid",
            format!("invalid `{field}` flag `{other}`; expected 0 or 1"),
        )),
    }
}

pub(crate) fn read_u32(payload: &[u8], offset: &mut usize, field: &str) -> BrowserResult<u32> {
    let bytes = read_exact(payload, offset, 4, field)?;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

pub(crate) fn read_u64(payload: &[u8], offset: &mut usize, field: &str) -> BrowserResult<u64> {
    let bytes = read_exact(payload, offset, 8, field)?;
    let mut raw = [0_u8; 8];
    raw.copy_from_slice(bytes);
    Ok(u64::from_be_bytes(raw))
}

pub(crate) fn read_i64(payload: &[u8], offset: &mut usize, field: &str) -> BrowserResult<i64> {
    let bytes = read_exact(payload, offset, 8, field)?;
    let mut raw = [0_u8; 8];
    raw.copy_from_slice(bytes);
    Ok(i64::from_be_bytes(raw))
}

pub(crate) fn read_status(
    payload: &[u8],
    offset: &mut usize,
    field: &str,
) -> BrowserResult<NetStatus> {
    pd_core::status_from_wire(read_u32(payload, offset, field)?)
}

/// Reads a status that must be a failure (cancel reasons, open failures).
pub(crate) fn read_error(
    payload: &[u8],
    offset: &mut usize,
    field: &str,
) -> BrowserResult<NetError> {
    match read_status(payload, offset, field)? {
        Err(error) => Ok(error),
        Ok(()) => Err(BrowserError::new(
            "ipc.message_field_invalid",
            format!("`{field}` must carry a failure status"),
        )),
    }
}

pub(crate) fn read_optional_u64(
    payload: &[u8],
    offset: &mut usize,
    field: &str,
) -> BrowserResult<Option<u64>> {
    if read_bool(payload, offset, field)? {
        return read_u64(payload, offset, field).map(Some);
    }
    Ok(None)
}

pub(crate) fn read_bytes(
    payload: &[u8],
    offset: &mut usize,
    field: &str,
) -> BrowserResult<Vec<u8>> {
    let len = read_u32(payload, offset, field)? as usize;
    read_exact(payload, offset, len, field).map(<[u8]>::to_vec)
}

pub(crate) fn read_string(
    payload: &[u8],
    offset: &mut usize,
    field: &str,
) -> BrowserResult<String> {
    let bytes = read_bytes(payload, offset, field)?;
    String::from_utf8(bytes).map_err(|error| {
        BrowserError::new(
            "ipc.message_utf8_invalid",
            format!("typed IPC field `{field}` is not valid UTF-8: {error}"),
        )
    })
}

fn read_exact<'a>(
    payload: &'a [u8],
    offset: &mut usize,
    len: usize,
    field: &str,
) -> BrowserResult<&'a [u8]> {
    let end = offset.saturating_add(len);
    if end > payload.len() {
        return Err(BrowserError::new(
            "ipc.message_truncated",
            format!("typed IPC payload ended while reading `{field}` (need {len} bytes)"),
        ));
    }

    let out = &payload[*offset..end];
    *offset = end;
    Ok(out)
}

pub(crate) fn expect_consumed(payload: &[u8], offset: usize) -> BrowserResult<()> {
    if offset != payload.len() {
        return Err(BrowserError::new(
            "ipc.message_trailing_bytes",
            format!(
                "typed IPC payload has trailing bytes (decoded {offset} of {})",
                payload.len()
            ),
        ));
    }
    Ok(())
}
