macro_rules! identifier {
    ($name: ident, $prefix: literal) => {
        /// A 1-based identifier. Its display form is the stable node name, e.g. `s1` or `h8`.
        #[derive(
            Debug,
            Copy,
            Clone,
            PartialOrd,
            Ord,
            PartialEq,
            Eq,
            Hash,
            serde::Serialize,
            serde::Deserialize,
        )]
        pub struct $name(usize);

        impl $name {
            /// The name prefix.
            pub const PREFIX: &'static str = $prefix;

            /// Creates a new ID. IDs start at 1.
            pub const fn new(val: usize) -> Self {
                Self(val)
            }

            /// Returns the inner representation of the ID.
            pub const fn inner(self) -> usize {
                self.0
            }

            /// Parses a node name such as `h8` back into its ID.
            pub fn from_name(name: &str) -> Option<Self> {
                name.strip_prefix($prefix)?
                    .parse()
                    .ok()
                    .filter(|&n| n > 0)
                    .map(Self)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}{}", $prefix, self.0)
            }
        }
    };
}
