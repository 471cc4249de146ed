/// Generates a BACnet enumeration that has a set of standard named values, a
/// vendor-proprietary range and a reserved remainder.
///
/// Besides the enum itself the macro emits:
///
/// * `NAMED`, a slice of every named variant
/// * `value()` and `is_proprietary()`
/// * `From<$unit>` / `From<$name> for $unit`
/// * `Display`: the variant name for named values, the bare number otherwise
/// * `FromStr` accepting either a number or a variant name (case, `-` and `_`
///   are ignored), failing with a generated `Parse<$name>Error`
///
/// # Example
///
/// ```rust
/// use bacnet_proxy_ip::bacnet_enum;
///
/// bacnet_enum! {
///     /// Fan speeds
///     FanSpeed: u16, proprietary 64..=255 {
///         Off = 0,
///         Low = 1,
///         High = 2,
///     }
/// }
///
/// assert_eq!(FanSpeed::from(2u16), FanSpeed::High);
/// assert_eq!(FanSpeed::from(100u16), FanSpeed::Proprietary(100));
/// assert_eq!(FanSpeed::from(3u16), FanSpeed::Reserved(3));
/// assert_eq!("high".parse::<FanSpeed>().unwrap(), FanSpeed::High);
/// assert_eq!("100".parse::<FanSpeed>().unwrap(), FanSpeed::Proprietary(100));
/// assert!("medium".parse::<FanSpeed>().is_err());
/// assert_eq!(FanSpeed::Low.to_string(), "Low");
/// ```
#[macro_export]
macro_rules! bacnet_enum {
    (
        $(#[$doc:meta])*
        $name:ident : $unit:ident, proprietary $lo:literal ..= $hi:literal {
            $($(#[$vdoc:meta])* $variant:ident = $value:expr,)+
        }
    ) => {
        $crate::__pastey::paste! {
            $(#[$doc])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
            pub enum $name {
                $($(#[$vdoc])* $variant,)+
                /// Vendor-specific value
                Proprietary($unit),
                /// Value neither named nor in the proprietary range
                Reserved($unit),
            }

            /// Error returned when a string names no known value
            #[derive(Debug, Clone, PartialEq, Eq)]
            pub struct [<Parse $name Error>] {
                input: String,
            }

            impl std::fmt::Display for [<Parse $name Error>] {
                fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                    write!(f, "unknown {} {:?}", stringify!($name), self.input)
                }
            }

            impl std::error::Error for [<Parse $name Error>] {}

            impl $name {
                /// Every named variant
                pub const NAMED: &'static [$name] = &[$($name::$variant,)+];

                /// Numeric wire value
                pub fn value(self) -> $unit {
                    match self {
                        $($name::$variant => $value,)+
                        $name::Proprietary(value) | $name::Reserved(value) => value,
                    }
                }

                pub fn is_proprietary(self) -> bool {
                    matches!(self, $name::Proprietary(_))
                }
            }

            impl From<$unit> for $name {
                fn from(value: $unit) -> Self {
                    $(if value == $value {
                        return $name::$variant;
                    })+
                    if ($lo..=$hi).contains(&value) {
                        $name::Proprietary(value)
                    } else {
                        $name::Reserved(value)
                    }
                }
            }

            impl From<$name> for $unit {
                fn from(value: $name) -> Self {
                    value.value()
                }
            }

            impl std::fmt::Display for $name {
                fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                    match self {
                        $($name::$variant => f.write_str(stringify!($variant)),)+
                        $name::Proprietary(value) | $name::Reserved(value) => write!(f, "{}", value),
                    }
                }
            }

            impl std::str::FromStr for $name {
                type Err = [<Parse $name Error>];

                fn from_str(s: &str) -> ::std::result::Result<Self, Self::Err> {
                    let trimmed = s.trim();
                    if let Ok(number) = trimmed.parse::<$unit>() {
                        return Ok($name::from(number));
                    }
                    let wanted: String = trimmed
                        .chars()
                        .filter(|c| *c != '-' && *c != '_')
                        .map(|c| c.to_ascii_lowercase())
                        .collect();
                    $name::NAMED
                        .iter()
                        .copied()
                        .find(|named| named.to_string().to_ascii_lowercase() == wanted)
                        .ok_or_else(|| [<Parse $name Error>] { input: s.to_string() })
                }
            }
        }
    };
}
