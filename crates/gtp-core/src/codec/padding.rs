//! Block padding for modes that need block-aligned input.

use cbc::cipher::block_padding::{AnsiX923, Pkcs7, RawPadding};

use crate::wire::PaddingMode;

use super::CodecError;

/// Pad `data` in place to a multiple of `block`.
///
/// A full block of padding is appended when `data` is already aligned, so
/// unpadding is always unambiguous. `PaddingMode::None` is a no-op.
pub fn pad(mode: PaddingMode, data: &mut Vec<u8>, block: usize) -> Result<(), CodecError> {
    if mode == PaddingMode::None {
        return Ok(());
    }
    check_block(block)?;
    let pos = data.len() % block;
    let start = data.len() - pos;
    data.resize(start + block, 0);
    let last = &mut data[start..];
    match mode {
        PaddingMode::Pkcs7 => Pkcs7::raw_pad(last, pos),
        PaddingMode::X923 => AnsiX923::raw_pad(last, pos),
        PaddingMode::None => {}
    }
    Ok(())
}

/// Strip padding previously added by [`pad`].
pub fn unpad(mode: PaddingMode, data: &mut Vec<u8>, block: usize) -> Result<(), CodecError> {
    if mode == PaddingMode::None {
        return Ok(());
    }
    check_block(block)?;
    if data.is_empty() || data.len() % block != 0 {
        return Err(CodecError::BadPadding);
    }
    let start = data.len() - block;
    let last = &data[start..];
    let kept = match mode {
        PaddingMode::Pkcs7 => Pkcs7::raw_unpad(last),
        PaddingMode::X923 => AnsiX923::raw_unpad(last),
        PaddingMode::None => Ok(last),
    }
    .map_err(|_| CodecError::BadPadding)?
    .len();
    data.truncate(start + kept);
    Ok(())
}

fn check_block(block: usize) -> Result<(), CodecError> {
    if block == 0 || block > u8::MAX as usize {
        return Err(CodecError::NoFixedBlockSize);
    }
    Ok(())
}
