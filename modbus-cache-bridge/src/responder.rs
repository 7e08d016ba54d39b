//! Answers downstream Modbus requests from the register cache.
//!
//! [`respond`] is shared by every server role. It only reads and writes the
//! cache; nothing here can wait on the upstream device.

use tokio_modbus::{ExceptionCode, Request, Response};

use crate::cache::{CacheError, RegisterCache};
use crate::config::MAX_READ_QUANTITY;

/// Largest register count a write-multiple request may carry.
pub const MAX_WRITE_QUANTITY: usize = 123;

fn exception(err: CacheError) -> ExceptionCode {
    match err {
        CacheError::NoDataYet(_) => ExceptionCode::GatewayTargetDevice,
        _ => ExceptionCode::IllegalDataAddress,
    }
}

fn read(cache: &RegisterCache, start: u16, count: u16) -> Result<Vec<u16>, ExceptionCode> {
    if count == 0 || count > MAX_READ_QUANTITY {
        return Err(ExceptionCode::IllegalDataValue);
    }
    cache.read_run(start, count).map_err(exception)
}

fn write(cache: &RegisterCache, start: u16, values: &[u16]) -> Result<u16, ExceptionCode> {
    if values.is_empty() || values.len() > MAX_WRITE_QUANTITY {
        return Err(ExceptionCode::IllegalDataValue);
    }
    let count = values.len() as u16;

    // Every address must exist before anything is written.
    let slots = cache
        .address_map()
        .resolve_range(start, count)
        .map_err(exception)?;
    for (slot, &value) in slots.into_iter().zip(values) {
        cache.set(slot, value);
    }
    Ok(count)
}

/// Compute the reply to a downstream request.
pub fn respond(request: &Request<'_>, cache: &RegisterCache) -> Result<Response, ExceptionCode> {
    match request {
        Request::ReadHoldingRegisters(start, count) => {
            read(cache, *start, *count).map(Response::ReadHoldingRegisters)
        }
        Request::ReadInputRegisters(start, count) => {
            read(cache, *start, *count).map(Response::ReadInputRegisters)
        }
        Request::WriteSingleRegister(address, value) => {
            write(cache, *address, &[*value])?;
            Ok(Response::WriteSingleRegister(*address, *value))
        }
        Request::WriteMultipleRegisters(start, values) => {
            let count = write(cache, *start, values)?;
            Ok(Response::WriteMultipleRegisters(*start, count))
        }
        _ => Err(ExceptionCode::IllegalFunction),
    }
}

/// Registers changed by a successful write request, as `(start, values)`.
pub fn written_registers(request: &Request<'_>) -> Option<(u16, Vec<u16>)> {
    match request {
        Request::WriteSingleRegister(address, value) => Some((*address, vec![*value])),
        Request::WriteMultipleRegisters(start, values) => Some((*start, values.to_vec())),
        _ => None,
    }
}
