//! Thin wrappers over the skb helpers.
//!
//! Packet mutation goes through helpers rather than direct pointer
//! writes so the verifier's pointer-invalidation rules never bite:
//! after any of these, reads must re-derive `data`/`data_end`.

use aya_ebpf::helpers::gen;
use aya_ebpf::programs::TcContext;
use core::ffi::c_void;

#[inline(always)]
fn skb_ptr(ctx: &TcContext) -> *mut c_void {
    ctx.skb.skb as *mut c_void
}

#[inline(always)]
pub fn skb_len(ctx: &TcContext) -> u32 {
    unsafe { (*ctx.skb.skb).len }
}

#[inline(always)]
pub fn skb_ifindex(ctx: &TcContext) -> u32 {
    unsafe { (*ctx.skb.skb).ifindex }
}

#[inline(always)]
pub fn skb_mark(ctx: &TcContext) -> u32 {
    unsafe { (*ctx.skb.skb).mark }
}

#[inline(always)]
pub fn set_skb_mark(ctx: &TcContext, mark: u32) {
    unsafe { (*ctx.skb.skb).mark = mark };
}

/// Write `v` into the packet at `offset`.
#[inline(always)]
pub fn store<T>(ctx: &TcContext, offset: usize, v: &T) -> Result<(), i64> {
    let rc = unsafe {
        gen::bpf_skb_store_bytes(
            skb_ptr(ctx),
            offset as u32,
            v as *const T as *const c_void,
            core::mem::size_of::<T>() as u32,
            0,
        )
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(rc)
    }
}

#[inline(always)]
pub fn l3_csum_replace(ctx: &TcContext, offset: usize, from: u64, to: u64, size: u64) -> Result<(), i64> {
    let rc = unsafe { gen::bpf_l3_csum_replace(skb_ptr(ctx), offset as u32, from, to, size) };
    if rc == 0 {
        Ok(())
    } else {
        Err(rc)
    }
}

#[inline(always)]
pub fn l4_csum_replace(ctx: &TcContext, offset: usize, from: u64, to: u64, flags: u64) -> Result<(), i64> {
    let rc = unsafe { gen::bpf_l4_csum_replace(skb_ptr(ctx), offset as u32, from, to, flags) };
    if rc == 0 {
        Ok(())
    } else {
        Err(rc)
    }
}

#[inline(always)]
pub fn adjust_room(ctx: &TcContext, len_diff: i32, mode: u32) -> Result<(), i64> {
    let rc = unsafe { gen::bpf_skb_adjust_room(skb_ptr(ctx), len_diff, mode, 0) };
    if rc == 0 {
        Ok(())
    } else {
        Err(rc)
    }
}

#[inline(always)]
pub fn change_tail(ctx: &TcContext, new_len: u32) -> Result<(), i64> {
    let rc = unsafe { gen::bpf_skb_change_tail(skb_ptr(ctx), new_len, 0) };
    if rc == 0 {
        Ok(())
    } else {
        Err(rc)
    }
}
