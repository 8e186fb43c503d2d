/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

/// Generates the boilerplate every crate in this workspace needs around its
/// `ErrorKind` enum: a boxed `Error` wrapper (so `Result<T, Error>` stays a
/// couple of words instead of growing with the largest `ErrorKind` variant),
/// a `kind()` accessor, and `From<T> for Error` for every wrapped type, so
/// callers can use `?` directly against the wrapped type instead of having
/// to go through `ErrorKind` first.
///
/// Usage:
/// ```ignore
/// #[derive(Debug, thiserror::Error)]
/// pub enum ErrorKind {
///     #[error("sql error: {0}")]
///     Sql(#[from] rusqlite::Error),
///     #[error("not found")]
///     NotFound,
/// }
///
/// error_support::define_error! {
///     ErrorKind {
///         (Sql, rusqlite::Error),
///     }
/// }
/// ```
#[macro_export]
macro_rules! define_error {
    ($kind:ty { $(($variant:ident, $type:ty)),* $(,)? }) => {
        #[derive(Debug)]
        pub struct Error(Box<$kind>);

        pub type Result<T> = std::result::Result<T, Error>;

        impl Error {
            #[inline]
            pub fn kind(&self) -> &$kind {
                &self.0
            }
        }

        impl std::fmt::Display for Error {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                std::fmt::Display::fmt(&self.0, f)
            }
        }

        impl std::error::Error for Error {
            fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
                std::error::Error::source(&*self.0)
            }
        }

        impl From<$kind> for Error {
            #[inline]
            fn from(kind: $kind) -> Error {
                Error(Box::new(kind))
            }
        }

        $(
            impl From<$type> for Error {
                #[inline]
                fn from(e: $type) -> Error {
                    Error(Box::new(<$kind>::from(e)))
                }
            }
        )*
    };
}
