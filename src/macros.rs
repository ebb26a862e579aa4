#[cfg_attr(not(feature = "client"), allow(unused_macros))]
macro_rules! auto_increment {
    () => {{
        use std::sync::atomic::{AtomicU32, Ordering};

        static COUNTER: AtomicU32 = AtomicU32::new(1);
        COUNTER.fetch_add(1, Ordering::Relaxed)
    }};
}

#[cfg_attr(not(feature = "client"), allow(unused_imports))]
pub(crate) use auto_increment;

macro_rules! device_types {
    ($($(#[doc = $doc:literal])* $name:ident = $path:literal,)*) => {
        /// ASCOM device category as reported by the Alpaca management API.
        #[derive(
            PartialOrd, Ord, PartialEq, Eq, Hash, Clone, Copy, Debug,
            derive_more::Display, serde::Serialize, serde::Deserialize,
        )]
        #[serde(try_from = "String")]
        pub enum DeviceType {
            $(
                $(#[doc = $doc])*
                #[display($path)]
                $name,
            )*
        }

        impl DeviceType {
            /// All known device types.
            pub const ALL: &[Self] = &[$(Self::$name,)*];

            /// Name of the device type as used in the `DeviceType` field of management responses.
            pub const fn name(self) -> &'static str {
                match self {
                    $(Self::$name => stringify!($name),)*
                }
            }
        }
    };
}

pub(crate) use device_types;
