/// Declares a `Copy` newtype over [`uuid::Uuid`] that serializes transparently
/// and parses from and displays as the hyphenated form.
///
/// The invoking crate must depend on `serde`.
#[macro_export]
macro_rules! uuid_id {
    ($(#[$meta:meta])* $vis:vis struct $name:ident;) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash,
            ::serde::Serialize, ::serde::Deserialize,
        )]
        #[serde(transparent)]
        $vis struct $name($crate::Uuid);

        impl $name {
            /// A fresh random (v4) id.
            pub fn new() -> Self {
                Self($crate::Uuid::new_v4())
            }

            pub fn from_uuid(uuid: $crate::Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> $crate::Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                ::std::fmt::Display::fmt(&self.0, f)
            }
        }

        impl ::std::str::FromStr for $name {
            type Err = $crate::UuidError;

            fn from_str(s: &str) -> ::std::result::Result<Self, Self::Err> {
                $crate::Uuid::parse_str(s).map(Self)
            }
        }

        impl From<$crate::Uuid> for $name {
            fn from(uuid: $crate::Uuid) -> Self {
                Self(uuid)
            }
        }

        impl From<$name> for $crate::Uuid {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

uuid_id! {
    /// Identifies exactly one event stream and one snapshot lineage.
    ///
    /// Archive paths and cache keys are derived from the hyphenated form.
    pub struct AggregateId;
}

impl AggregateId {
    /// Two-level directory prefix from the leading hex digits, e.g. `"3f/a2"`.
    pub fn shard_prefix(&self) -> String {
        let simple = self.0.simple().to_string();
        format!("{}/{}", &simple[0..2], &simple[2..4])
    }
}
