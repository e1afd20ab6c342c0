//! Path types tailored to `cairn`.
//!
//! Nearly every path the engine touches is one of two things: an absolute
//! location on the machine (the repo root, the object database, a file being
//! hashed) or a workspace-relative location recorded in pipeline files and
//! lockfiles. Mixing the two up is the classic source of "works in my repo"
//! bugs, so the base of a path is part of its type.
//!
//! Relative paths are additionally the unit of serialization: they are
//! written to lockfiles and tree objects, and must round-trip across
//! platforms. They serialize with `/` separators regardless of host OS.
//!
//! The kind of a path (`File`, `Dir`, `Entry`) is about intent, not about
//! what is currently on disk; a declared output may not exist yet, and a
//! dependency's kind is only known once it is stat'ed. `Entry` is the
//! "don't know yet" kind used for stage deps and outs.

use std::{
    any::type_name,
    borrow::Cow,
    ffi::{OsStr, OsString},
    marker::PhantomData,
    path::{Component, Path, PathBuf},
    str::FromStr,
};

use color_eyre::{
    Report, Result,
    eyre::{Context, bail},
};
use derive_more::Display;
use duplicate::duplicate_item;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tap::Pipe;

pub type AbsFilePath = TypedPath<Abs, File>;
pub type AbsDirPath = TypedPath<Abs, Dir>;
pub type AbsEntryPath = TypedPath<Abs, Entry>;
pub type RelFilePath = TypedPath<Rel, File>;
pub type RelDirPath = TypedPath<Rel, Dir>;
pub type RelEntryPath = TypedPath<Rel, Entry>;

/// Make a [`RelFilePath`] from a literal with compile-time validation.
#[macro_export]
macro_rules! mk_rel_file {
    ($path:literal) => {{
        $crate::assert_relative!($path);
        $crate::path::RelFilePath::try_from($path).unwrap()
    }};
}

/// Make a [`RelDirPath`] from a literal with compile-time validation.
#[macro_export]
macro_rules! mk_rel_dir {
    ($path:literal) => {{
        $crate::assert_relative!($path);
        $crate::path::RelDirPath::try_from($path).unwrap()
    }};
}

/// Assert that the string literal is a relative path.
#[doc(hidden)]
#[macro_export]
macro_rules! assert_relative {
    ($path:literal) => {{
        const _: () = {
            assert!(!const_str::starts_with!($path, '/'), "path is not relative");
            assert!(
                !const_str::starts_with!($path, '\\'),
                "path is not relative"
            );
        };
    }};
}

/// Marker: the path starts at the filesystem root.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct Abs;

/// Marker: the path starts at some anchor directory, usually the repo root
/// or a stage's working directory.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct Rel;

/// Marker: the path names a directory.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct Dir;

/// Marker: the path names a regular file.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct File;

/// Marker: the path names either a file or a directory; which one is only
/// discovered by stat'ing the workspace.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct Entry;

/// A filesystem location tagged with its base and kind.
///
/// The tags express intent within the program; nothing here validates that
/// the on-disk entity exists or matches the kind (that check is racy anyway).
/// Construction through `TryFrom`/`FromStr` validates the base only.
///
/// No normalization is performed: `a/b` and `a/b/` are distinct, `..` is not
/// collapsed. Callers that need a canonical path normalize before
/// constructing one of these.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Display)]
#[display("{}", self.inner.display())]
pub struct TypedPath<Base, Kind> {
    base: PhantomData<Base>,
    kind: PhantomData<Kind>,
    inner: PathBuf,
}

impl<B, K> TypedPath<B, K> {
    /// View the path as a standard path.
    pub fn as_std_path(&self) -> &Path {
        &self.inner
    }

    /// View the path as a lossily-converted string.
    pub fn as_str_lossy(&self) -> Cow<'_, str> {
        self.inner.to_string_lossy()
    }

    /// View the path as an OS string.
    pub fn as_os_str(&self) -> &OsStr {
        self.inner.as_os_str()
    }

    /// The final component, if there is one.
    pub fn file_name(&self) -> Option<&OsStr> {
        self.inner.file_name()
    }

    /// The parent directory, if one exists.
    ///
    /// Unlike the standard library, the parent of a single-component
    /// relative path is `None`, not the empty path.
    pub fn parent(&self) -> Option<TypedPath<B, Dir>> {
        self.inner
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(ToOwned::to_owned)
            .map(TypedPath::new_unchecked)
    }

    /// Iterate the components of the path.
    pub fn components(&self) -> impl DoubleEndedIterator<Item = Component<'_>> {
        self.inner.components()
    }

    /// Whether `self` equals `other` or sits underneath it.
    ///
    /// Comparison is component-wise, so `data/out` is inside `data` but
    /// `data-extra` is not. This is the predicate behind overlapping-output
    /// detection.
    pub fn contains_or_equals<B2, K2>(&self, other: &TypedPath<B2, K2>) -> bool {
        let mut mine = self.inner.components();
        for theirs in other.inner.components() {
            match mine.next() {
                Some(c) if c == theirs => continue,
                _ => return false,
            }
        }
        true
    }

    /// Render with `/` separators for serialization.
    ///
    /// Lockfiles, tree objects, and stage files must be byte-identical across
    /// platforms, so stored paths always use POSIX separators.
    pub fn to_posix(&self) -> String {
        self.inner
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }

    fn new_unchecked(inner: impl Into<PathBuf>) -> Self {
        Self {
            base: PhantomData,
            kind: PhantomData,
            inner: inner.into(),
        }
    }
}

#[duplicate_item(
    ty_from;
    [ PathBuf ];
    [ &PathBuf ];
    [ &Path ];
    [ String ];
    [ &String ];
    [ &str ];
    [ OsString ];
    [ &OsStr ];
)]
impl<B: Validator, K: Validator> TryFrom<ty_from> for TypedPath<B, K> {
    type Error = Report;

    fn try_from(value: ty_from) -> Result<Self, Self::Error> {
        #[allow(
            clippy::useless_conversion,
            reason = "only useless for the PathBuf branch of the macro"
        )]
        let value = PathBuf::from(value);
        B::validate(&value).with_context(|| format!("validate base {:?}", type_name::<B>()))?;
        K::validate(&value).with_context(|| format!("validate kind {:?}", type_name::<K>()))?;
        Ok(Self::new_unchecked(value))
    }
}

impl<B: Validator, K: Validator> FromStr for TypedPath<B, K> {
    type Err = Report;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::try_from(s)
    }
}

impl<B, K> AsRef<TypedPath<B, K>> for TypedPath<B, K> {
    fn as_ref(&self) -> &TypedPath<B, K> {
        self
    }
}

impl<B, K> From<TypedPath<B, K>> for PathBuf {
    fn from(value: TypedPath<B, K>) -> Self {
        value.inner
    }
}

impl<B, K> std::fmt::Debug for TypedPath<B, K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.inner)
    }
}

impl<'de, B: Validator, K: Validator> Deserialize<'de> for TypedPath<B, K> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let p = String::deserialize(deserializer)?;
        Self::try_from(p).map_err(serde::de::Error::custom)
    }
}

impl<B, K> Serialize for TypedPath<B, K> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.to_posix().serialize(serializer)
    }
}

impl AbsDirPath {
    /// The current working directory of the process.
    pub fn current() -> Result<AbsDirPath> {
        let cwd = std::env::current_dir().context("get current dir")?;
        Self::try_from(cwd).context("convert cwd")
    }
}

// Kind conversions: deps and outs are declared as `Entry` paths and resolved
// to files or directories once stat'ed; trees address their members as files.
#[duplicate_item(
    base;
    [ Abs ];
    [ Rel ];
)]
impl TypedPath<base, Entry> {
    /// Reinterpret as a file path.
    pub fn as_file(&self) -> TypedPath<base, File> {
        TypedPath::new_unchecked(&self.inner)
    }

    /// Reinterpret as a directory path.
    pub fn as_dir(&self) -> TypedPath<base, Dir> {
        TypedPath::new_unchecked(&self.inner)
    }
}

#[duplicate_item(
    kind;
    [ File ];
    [ Dir ];
)]
impl TypedPath<Rel, kind> {
    /// Forget the kind.
    pub fn as_entry(&self) -> RelEntryPath {
        TypedPath::new_unchecked(&self.inner)
    }
}

#[duplicate_item(
    kind;
    [ File ];
    [ Dir ];
)]
impl TypedPath<Abs, kind> {
    /// Forget the kind.
    pub fn as_entry(&self) -> AbsEntryPath {
        TypedPath::new_unchecked(&self.inner)
    }
}

/// Join typed relative paths onto an absolute directory.
pub trait JoinWith<Other> {
    type Output;

    /// Join `other` underneath `self`.
    fn join(&self, other: Other) -> Self::Output;
}

#[duplicate_item(
    ty_other ty_output;
    [ TypedPath<Rel, Dir> ] [ TypedPath<Abs, Dir> ];
    [ &TypedPath<Rel, Dir> ] [ TypedPath<Abs, Dir> ];
    [ TypedPath<Rel, File> ] [ TypedPath<Abs, File> ];
    [ &TypedPath<Rel, File> ] [ TypedPath<Abs, File> ];
    [ TypedPath<Rel, Entry> ] [ TypedPath<Abs, Entry> ];
    [ &TypedPath<Rel, Entry> ] [ TypedPath<Abs, Entry> ];
)]
impl JoinWith<ty_other> for TypedPath<Abs, Dir> {
    type Output = ty_output;

    fn join(&self, other: ty_other) -> Self::Output {
        self.inner.join(&other.inner).pipe(TypedPath::new_unchecked)
    }
}

/// Join runtime strings onto an absolute directory, validating the result.
pub trait TryJoinWith {
    /// Join `dir` underneath `self` as a directory.
    fn try_join_dir(&self, dir: impl AsRef<str>) -> Result<AbsDirPath>;

    /// Join `file` underneath `self` as a file.
    fn try_join_file(&self, file: impl AsRef<str>) -> Result<AbsFilePath>;
}

impl TryJoinWith for AbsDirPath {
    fn try_join_dir(&self, dir: impl AsRef<str>) -> Result<AbsDirPath> {
        self.inner.join(dir.as_ref()).pipe(AbsDirPath::try_from)
    }

    fn try_join_file(&self, file: impl AsRef<str>) -> Result<AbsFilePath> {
        self.inner.join(file.as_ref()).pipe(AbsFilePath::try_from)
    }
}

/// Strip a base directory off an absolute path, leaving a relative one.
pub trait RelativeTo<Other> {
    type Output;

    /// Make `self` relative to `other` if possible.
    fn relative_to(&self, other: Other) -> Self::Output;
}

#[duplicate_item(
    ty_self ty_output;
    [ TypedPath<Abs, Dir> ] [ TypedPath<Rel, Dir> ];
    [ TypedPath<Abs, File> ] [ TypedPath<Rel, File> ];
    [ TypedPath<Abs, Entry> ] [ TypedPath<Rel, Entry> ];
)]
impl RelativeTo<&TypedPath<Abs, Dir>> for ty_self {
    type Output = Result<ty_output>;

    fn relative_to(&self, other: &TypedPath<Abs, Dir>) -> Self::Output {
        self.inner
            .strip_prefix(&other.inner)
            .with_context(|| format!("make {:?} relative to {:?}", self.inner, other.inner))
            .and_then(TypedPath::try_from)
    }
}

/// Validates the inner path for a [`TypedPath`] tag.
pub trait Validator {
    fn validate(path: &Path) -> Result<()>;
}

impl Validator for Rel {
    fn validate(path: &Path) -> Result<()> {
        if !path.is_relative() {
            bail!("path is not relative: {path:?}");
        }
        Ok(())
    }
}

impl Validator for Abs {
    fn validate(path: &Path) -> Result<()> {
        if !path.is_absolute() {
            bail!("path is not absolute: {path:?}");
        }
        Ok(())
    }
}

#[duplicate_item(
    ty_self;
    [ Dir ];
    [ File ];
    [ Entry ];
)]
impl Validator for ty_self {
    fn validate(_: &Path) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq as pretty_assert_eq;

    #[test]
    fn rejects_wrong_base() {
        assert!(RelFilePath::try_from("/etc/passwd").is_err());
        assert!(AbsFilePath::try_from("relative/file").is_err());
    }

    #[test]
    fn join_and_relative_round_trip() {
        let base = AbsDirPath::try_from("/work/repo").unwrap();
        let rel = mk_rel_file!("data/items.csv");
        let abs = base.join(&rel);
        pretty_assert_eq!(abs.as_std_path(), Path::new("/work/repo/data/items.csv"));
        let back = abs.relative_to(&base).unwrap();
        pretty_assert_eq!(back, rel);
    }

    #[test]
    fn parent_of_single_component_is_none() {
        let p = mk_rel_file!("foo");
        assert!(p.parent().is_none());

        let p = mk_rel_file!("dir/foo");
        pretty_assert_eq!(p.parent().unwrap(), mk_rel_dir!("dir"));
    }

    #[test]
    fn containment_is_component_wise() {
        let out = RelEntryPath::try_from("data/out").unwrap();
        let parent = RelEntryPath::try_from("data").unwrap();
        let sibling = RelEntryPath::try_from("data-extra").unwrap();

        assert!(out.contains_or_equals(&parent));
        assert!(out.contains_or_equals(&out));
        assert!(!out.contains_or_equals(&sibling));
        assert!(!parent.contains_or_equals(&out));
    }

    #[test]
    fn serializes_as_posix() {
        let p = mk_rel_file!("data/items.csv");
        let json = serde_json::to_string(&p).unwrap();
        pretty_assert_eq!(json, r#""data/items.csv""#);

        let back: RelFilePath = serde_json::from_str(&json).unwrap();
        pretty_assert_eq!(back, p);
    }
}
