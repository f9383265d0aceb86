//! # Kernel Configuration and Boot Interface
//!
//! Data handed to the memory subsystem by the boot code and the fixed memory
//! layout every component agrees on.
//!
//! ## Boot Information ([`boot`])
//! The boot-info parser (outside this workspace) turns the firmware memory map
//! into a list of [`MemoryRegion`](boot::MemoryRegion) records. The list is
//! supplied once, before the frame allocator is initialized, and is read-only
//! afterwards.
//!
//! ## Memory Layout ([`memory`])
//!
//! ```text
//! Virtual Address Space Layout (64-bit):
//!
//! 0x0000_0000_0000_0000 ┌─────────────────────────────────┐
//!                       │  Identity map of low memory     │ IDENTITY_LOW_BYTES
//!                       ├─────────────────────────────────┤
//!                       │         (unmapped)              │
//! HHDM_BASE             ├─────────────────────────────────┤ 0xffff_8880_0000_0000
//!                       │   Higher Half Direct Mapping    │
//! KERNEL_BASE           ├─────────────────────────────────┤ 0xffff_ffff_8000_0000
//!                       │   Kernel image                  │ KERNEL_IMAGE_BYTES
//! KERNEL_HEAP_BASE      ├─────────────────────────────────┤ 0xffff_ffff_9000_0000
//!                       │   Kernel heap                   │ KERNEL_HEAP_SIZE
//! 0xFFFF_FFFF_FFFF_FFFF └─────────────────────────────────┘
//! ```
//!
//! All constants are checked at compile time.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod memory;
