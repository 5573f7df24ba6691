//! Structured records.
//!
//! Records declare their members through [`traversable_record!`], which emits
//! the struct and a `Traversable` impl visiting each member in declaration
//! order. Members annotated `#[member(computed)]`, `#[member(not_mapped)]` or
//! `#[member(read_only)]` are reported as skipped and left untouched.
//!
//! [`traversable_record!`]: crate::traversable_record

/// Per-member annotations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemberFlags(u8);

impl MemberFlags {
    pub const NONE: Self = Self(0);
    const COMPUTED: u8 = 1;
    const NOT_MAPPED: u8 = 1 << 1;
    const READ_ONLY: u8 = 1 << 2;

    /// Value derived by the database or the application, not read from storage.
    pub const fn computed(self) -> Self {
        Self(self.0 | Self::COMPUTED)
    }

    /// Member with no storage column.
    pub const fn not_mapped(self) -> Self {
        Self(self.0 | Self::NOT_MAPPED)
    }

    /// Member that must not be written back.
    pub const fn read_only(self) -> Self {
        Self(self.0 | Self::READ_ONLY)
    }

    pub const fn is_computed(self) -> bool {
        self.0 & Self::COMPUTED != 0
    }

    pub const fn is_not_mapped(self) -> bool {
        self.0 & Self::NOT_MAPPED != 0
    }

    pub const fn is_read_only(self) -> bool {
        self.0 & Self::READ_ONLY != 0
    }

    /// Why a member with these flags is skipped, if it is.
    pub const fn skip_reason(self) -> Option<SkipReason> {
        if self.is_computed() {
            Some(SkipReason::Computed)
        } else if self.is_not_mapped() {
            Some(SkipReason::NotMapped)
        } else if self.is_read_only() {
            Some(SkipReason::ReadOnly)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Computed,
    NotMapped,
    ReadOnly,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Computed => write!(f, "computed"),
            Self::NotMapped => write!(f, "not_mapped"),
            Self::ReadOnly => write!(f, "read_only"),
        }
    }
}

/// Declare a struct whose members the sanitizer visits.
///
/// Field doc comments are kept; the `#[member(..)]` annotation goes after them.
///
/// # Example
///
/// ```
/// pooled_db::traversable_record! {
///     #[derive(Debug, Clone)]
///     pub struct Employee {
///         pub id: i64,
///         /// Display name.
///         pub name: String,
///         #[member(computed)]
///         pub search_key: String,
///         #[member(not_mapped, read_only)]
///         pub notes: Option<String>,
///     }
/// }
///
/// let mut employee = Employee {
///     id: 1,
///     name: " Ann ".into(),
///     search_key: " ann ".into(),
///     notes: Some(" hi ".into()),
/// };
/// pooled_db::sanitize::sanitize(&mut employee);
/// assert_eq!(employee.name, "Ann");
/// assert_eq!(employee.search_key, " ann ");
/// ```
#[macro_export]
macro_rules! traversable_record {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            $(
                $(#[doc = $doc:expr])*
                $(#[member($($flag:ident),+ $(,)?)])?
                $fvis:vis $field:ident : $ty:ty
            ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        $vis struct $name {
            $(
                $(#[doc = $doc])*
                $fvis $field: $ty,
            )*
        }

        impl $crate::sanitize::Traversable for $name {
            fn shape(&self) -> $crate::sanitize::Shape {
                $crate::sanitize::Shape::Record
            }

            fn children(&mut self) -> ::std::vec::Vec<$crate::sanitize::Child<'_>> {
                let mut children = ::std::vec::Vec::new();
                $(
                    let flags = $crate::sanitize::MemberFlags::NONE $($( .$flag() )+)?;
                    match flags.skip_reason() {
                        ::std::option::Option::Some(reason) => {
                            children.push($crate::sanitize::Child::Skipped {
                                member: stringify!($field),
                                reason,
                            })
                        }
                        ::std::option::Option::None => {
                            children.push($crate::sanitize::Child::Node(&mut self.$field))
                        }
                    }
                )*
                children
            }
        }
    };
}
