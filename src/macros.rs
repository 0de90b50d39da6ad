//! # Internal Macros
//!
//! Accessor generation for zerocopy header structs. All on-disk headers in
//! modelstore store multi-byte fields as little-endian wrapper types
//! (`U32`/`U64`); these macros generate the native-typed getters and
//! setters so header code reads like ordinary struct access.
//!
//! ```ignore
//! #[repr(C)]
//! struct FileHeader {
//!     append_end: U64,
//!     chunk_count: U64,
//! }
//!
//! impl FileHeader {
//!     zerocopy_accessors! {
//!         append_end: u64,
//!         chunk_count: u64,
//!     }
//! }
//! // generates append_end() / set_append_end() and chunk_count() / set_chunk_count()
//! ```

/// Generates getter and setter methods for zerocopy little-endian fields.
#[macro_export]
macro_rules! zerocopy_accessors {
    (@impl $field:ident, u32) => {
        ::paste::paste! {
            #[inline]
            pub fn $field(&self) -> u32 {
                self.$field.get()
            }

            #[inline]
            pub fn [<set_ $field>](&mut self, val: u32) {
                self.$field = ::zerocopy::little_endian::U32::new(val);
            }
        }
    };
    (@impl $field:ident, u64) => {
        ::paste::paste! {
            #[inline]
            pub fn $field(&self) -> u64 {
                self.$field.get()
            }

            #[inline]
            pub fn [<set_ $field>](&mut self, val: u64) {
                self.$field = ::zerocopy::little_endian::U64::new(val);
            }
        }
    };
    ($($field:ident : $ty:tt),* $(,)?) => {
        $(
            $crate::zerocopy_accessors!(@impl $field, $ty);
        )*
    };
}

/// Generates only getter methods for zerocopy little-endian fields (read-only).
#[macro_export]
macro_rules! zerocopy_getters {
    ($($field:ident : $native_ty:ty),* $(,)?) => {
        $(
            #[inline]
            pub fn $field(&self) -> $native_ty {
                self.$field.get()
            }
        )*
    };
}
