//! `buffer` library
//!
//! Buffers are fixed-size mutable byte arrays. Offsets are zero-based and
//! multi-byte values are little-endian.

use super::{new_lib, LibFn};
use crate::gc::Handle;
use crate::vm::{VmResult, VM};

/// Largest buffer `buffer.create` will allocate
const MAX_BUFFER_SIZE: i64 = 1 << 30;

const FUNCTIONS: &[(&str, LibFn)] = &[
    ("create", create),
    ("fromstring", fromstring),
    ("tostring", tostring),
    ("len", len),
    ("readu8", readu8),
    ("writeu8", writeu8),
    ("readi32", readi32),
    ("writei32", writei32),
    ("readf64", readf64),
    ("writef64", writef64),
];

pub(crate) fn open(vm: &mut VM) {
    new_lib(vm, "buffer", FUNCTIONS);
}

fn create(vm: &mut VM) -> VmResult<usize> {
    let size = vm.check_integer(1)?;
    if !(0..=MAX_BUFFER_SIZE).contains(&size) {
        return Err(vm.arg_error(1, "size"));
    }
    vm.new_buffer(size as usize);
    Ok(1)
}

fn fromstring(vm: &mut VM) -> VmResult<usize> {
    let bytes = vm.check_string(1)?;
    vm.push_buffer(&bytes);
    Ok(1)
}

fn tostring(vm: &mut VM) -> VmResult<usize> {
    let buffer = vm.check_buffer(1)?;
    let bytes = vm.heap.buffer(buffer).clone();
    vm.push_bytes(&bytes);
    Ok(1)
}

fn len(vm: &mut VM) -> VmResult<usize> {
    let buffer = vm.check_buffer(1)?;
    let n = vm.heap.buffer(buffer).len();
    vm.push_number(n as f64);
    Ok(1)
}

/// Buffer and byte range for an access of `width` bytes at argument 2
fn range(vm: &mut VM, width: usize) -> VmResult<(Handle, usize)> {
    let buffer = vm.check_buffer(1)?;
    let offset = vm.check_integer(2)?;
    let len = vm.heap.buffer(buffer).len();
    match usize::try_from(offset) {
        Ok(start) if start.checked_add(width).is_some_and(|end| end <= len) => Ok((buffer, start)),
        _ => Err(vm.raise_message("buffer access out of bounds")),
    }
}

fn read<const N: usize>(vm: &mut VM) -> VmResult<[u8; N]> {
    let (buffer, start) = range(vm, N)?;
    let mut bytes = [0; N];
    bytes.copy_from_slice(&vm.heap.buffer(buffer)[start..start + N]);
    Ok(bytes)
}

fn write<const N: usize>(vm: &mut VM, bytes: [u8; N]) -> VmResult<usize> {
    let (buffer, start) = range(vm, N)?;
    vm.heap.buffer_mut(buffer)[start..start + N].copy_from_slice(&bytes);
    Ok(0)
}

fn readu8(vm: &mut VM) -> VmResult<usize> {
    let [byte] = read::<1>(vm)?;
    vm.push_number(f64::from(byte));
    Ok(1)
}

fn writeu8(vm: &mut VM) -> VmResult<usize> {
    let value = vm.check_integer(3)?;
    write(vm, [value as u8])
}

fn readi32(vm: &mut VM) -> VmResult<usize> {
    let bytes = read::<4>(vm)?;
    vm.push_number(f64::from(i32::from_le_bytes(bytes)));
    Ok(1)
}

fn writei32(vm: &mut VM) -> VmResult<usize> {
    // Wraps like a C cast through u32
    let value = vm.check_integer(3)?;
    write(vm, (value as i32).to_le_bytes())
}

fn readf64(vm: &mut VM) -> VmResult<usize> {
    let bytes = read::<8>(vm)?;
    vm.push_number(f64::from_le_bytes(bytes));
    Ok(1)
}

fn writef64(vm: &mut VM) -> VmResult<usize> {
    let value = vm.check_number(3)?;
    write(vm, value.to_le_bytes())
}
