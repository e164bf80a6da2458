//! Per-architecture access to the trapped register context.
//!
//! Everything that pokes at `ucontext_t` lives here so the fault router
//! stays free of architecture conditionals. Each supported target
//! provides `get_sp`/`get_pc`/`get_fp`, `set_ip_sp_lr`, and the
//! write-fault query; unsupported targets fall back to calling the
//! injected routine directly from the handler.

use cfg_if::cfg_if;

cfg_if! {
    if #[cfg(all(target_os = "linux", target_arch = "x86_64"))] {
        pub(crate) const SUPPORTED: bool = true;

        pub(crate) unsafe fn get_sp(ctx: *mut libc::c_void) -> usize {
            let ctx = &*(ctx as *const libc::ucontext_t);
            ctx.uc_mcontext.gregs[libc::REG_RSP as usize] as usize
        }

        pub(crate) unsafe fn get_pc(ctx: *mut libc::c_void) -> usize {
            let ctx = &*(ctx as *const libc::ucontext_t);
            ctx.uc_mcontext.gregs[libc::REG_RIP as usize] as usize
        }

        pub(crate) unsafe fn get_fp(ctx: *mut libc::c_void) -> usize {
            let ctx = &*(ctx as *const libc::ucontext_t);
            ctx.uc_mcontext.gregs[libc::REG_RBP as usize] as usize
        }

        pub(crate) unsafe fn set_ip_sp_lr(ctx: *mut libc::c_void, ip: usize, mut sp: usize, _lr: usize) {
            let ctx = &mut *(ctx as *mut libc::ucontext_t);
            // Simulate the return-address push of a call.
            sp -= std::mem::size_of::<usize>();
            ctx.uc_mcontext.gregs[libc::REG_RSP as usize] = sp as libc::greg_t;
            ctx.uc_mcontext.gregs[libc::REG_RIP as usize] = ip as libc::greg_t;
        }

        /// Bit 1 of the page-fault error code is the write bit.
        pub(crate) fn exc_reg_is_write_fault(err: u64) -> bool {
            const WRITE_FAULT: u64 = 0x2;
            err & WRITE_FAULT != 0
        }

        pub(crate) unsafe fn is_write_fault(ctx: *mut libc::c_void) -> bool {
            let ctx = &*(ctx as *const libc::ucontext_t);
            exc_reg_is_write_fault(ctx.uc_mcontext.gregs[libc::REG_ERR as usize] as u64)
        }
    } else if #[cfg(all(target_os = "linux", target_arch = "aarch64"))] {
        pub(crate) const SUPPORTED: bool = true;

        pub(crate) unsafe fn get_sp(ctx: *mut libc::c_void) -> usize {
            let ctx = &*(ctx as *const libc::ucontext_t);
            ctx.uc_mcontext.sp as usize
        }

        pub(crate) unsafe fn get_pc(ctx: *mut libc::c_void) -> usize {
            let ctx = &*(ctx as *const libc::ucontext_t);
            ctx.uc_mcontext.pc as usize
        }

        pub(crate) unsafe fn get_fp(ctx: *mut libc::c_void) -> usize {
            let ctx = &*(ctx as *const libc::ucontext_t);
            ctx.uc_mcontext.regs[29] as usize
        }

        pub(crate) unsafe fn set_ip_sp_lr(ctx: *mut libc::c_void, ip: usize, sp: usize, lr: usize) {
            let ctx = &mut *(ctx as *mut libc::ucontext_t);
            ctx.uc_mcontext.sp = sp as libc::c_ulonglong;
            ctx.uc_mcontext.regs[30] = lr as libc::c_ulonglong;
            ctx.uc_mcontext.pc = ip as libc::c_ulonglong;
        }

        /// EC says data abort and the WnR bit is set.
        pub(crate) fn exc_reg_is_write_fault(esr: u64) -> bool {
            const EC_MASK: u64 = 0x3f << 26;
            const EC_DATA_ABORT: u64 = 0x24 << 26;
            const ISS_DA_WNR: u64 = 1 << 6;
            (esr & EC_MASK) == EC_DATA_ABORT && (esr & ISS_DA_WNR) != 0
        }

        // The kernel parks extension records (including the ESR record)
        // in the __reserved area of struct sigcontext, which starts
        // 16-byte aligned after the pstate field: offset 288.
        const ESR_CTX_OFFSET: usize = 288;
        const ESR_MAGIC: u32 = 0x4553_5201;

        pub(crate) unsafe fn is_write_fault(ctx: *mut libc::c_void) -> bool {
            let ctx = &*(ctx as *const libc::ucontext_t);
            let base = &ctx.uc_mcontext as *const _ as *const u8;
            let end = base.add(std::mem::size_of_val(&ctx.uc_mcontext));
            let mut extra = base.add(ESR_CTX_OFFSET);
            while extra.add(8) <= end {
                let magic = (extra as *const u32).read_unaligned();
                if magic == 0 {
                    return false;
                }
                let size = (extra.add(4) as *const u32).read_unaligned();
                if magic == ESR_MAGIC {
                    let esr = (extra.add(8) as *const u64).read_unaligned();
                    return exc_reg_is_write_fault(esr);
                }
                if size == 0 {
                    return false;
                }
                extra = extra.add(size as usize);
            }
            false
        }
    } else if #[cfg(all(target_os = "linux", target_arch = "arm"))] {
        pub(crate) const SUPPORTED: bool = true;

        pub(crate) unsafe fn get_sp(ctx: *mut libc::c_void) -> usize {
            let ctx = &*(ctx as *const libc::ucontext_t);
            ctx.uc_mcontext.arm_sp as usize
        }

        pub(crate) unsafe fn get_pc(ctx: *mut libc::c_void) -> usize {
            let ctx = &*(ctx as *const libc::ucontext_t);
            ctx.uc_mcontext.arm_pc as usize
        }

        pub(crate) unsafe fn get_fp(ctx: *mut libc::c_void) -> usize {
            let ctx = &*(ctx as *const libc::ucontext_t);
            ctx.uc_mcontext.arm_fp as usize
        }

        pub(crate) unsafe fn set_ip_sp_lr(ctx: *mut libc::c_void, ip: usize, sp: usize, lr: usize) {
            let ctx = &mut *(ctx as *mut libc::ucontext_t);
            // Some sigreturn targets run in Thumb state. Mimic a `bx` by
            // setting the T bit of CPSR to the target's low-bit tag.
            let mut target = ip as libc::c_ulong;
            let mut cpsr = ctx.uc_mcontext.arm_cpsr;
            if target & 1 != 0 {
                target &= !1;
                cpsr |= 1 << 5;
            } else {
                cpsr &= !(1 << 5);
            }
            ctx.uc_mcontext.arm_cpsr = cpsr;
            ctx.uc_mcontext.arm_sp = sp as libc::c_ulong;
            ctx.uc_mcontext.arm_lr = lr as libc::c_ulong;
            ctx.uc_mcontext.arm_pc = target;
        }

        // No reliable write-fault bit is exposed on 32-bit ARM.
        pub(crate) unsafe fn is_write_fault(_ctx: *mut libc::c_void) -> bool {
            false
        }
    } else {
        pub(crate) const SUPPORTED: bool = false;

        pub(crate) unsafe fn get_sp(_ctx: *mut libc::c_void) -> usize { 0 }
        pub(crate) unsafe fn get_pc(_ctx: *mut libc::c_void) -> usize { 0 }
        pub(crate) unsafe fn get_fp(_ctx: *mut libc::c_void) -> usize { 0 }
        pub(crate) unsafe fn set_ip_sp_lr(_ctx: *mut libc::c_void, _ip: usize, _sp: usize, _lr: usize) {}
        pub(crate) unsafe fn is_write_fault(_ctx: *mut libc::c_void) -> bool { false }
    }
}

#[cfg(test)]
mod tests {
    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    #[test]
    fn test_x86_err_code_write_bit() {
        use super::exc_reg_is_write_fault;
        // USER_MODE | WRITE_FAULT | PAGE_PRESENT
        assert!(exc_reg_is_write_fault(0x7));
        assert!(exc_reg_is_write_fault(0x2));
        // read fault on a present page
        assert!(!exc_reg_is_write_fault(0x5));
        assert!(!exc_reg_is_write_fault(0x0));
    }

    #[cfg(all(target_os = "linux", target_arch = "aarch64"))]
    #[test]
    fn test_aarch64_esr_decode() {
        use super::exc_reg_is_write_fault;
        let data_abort_write = (0x24u64 << 26) | (1 << 6);
        let data_abort_read = 0x24u64 << 26;
        let insn_abort_write = (0x20u64 << 26) | (1 << 6);
        assert!(exc_reg_is_write_fault(data_abort_write));
        assert!(!exc_reg_is_write_fault(data_abort_read));
        assert!(!exc_reg_is_write_fault(insn_abort_write));
    }
}
