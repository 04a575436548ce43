//! DRM format tables and format sets.
//!
//! The scanout pipeline constantly asks three questions about a format:
//! does it carry alpha, what is its opaque (or transparent) sibling, and
//! how many bits does a pixel occupy. [`FormatSet`] is the shared,
//! order-preserving set of `(fourcc, modifier)` pairs used for plane
//! input formats, render formats and their intersections.

use std::sync::Arc;

use indexmap::IndexSet;

pub use drm_fourcc::{DrmFormat as Format, DrmFourcc as Fourcc, DrmModifier as Modifier};

macro_rules! format_table {
    ($($fourcc:ident { $(opaque: $opaque:ident,)? alpha: $alpha:expr, bpp: $bpp:expr, depth: $depth:expr }),* $(,)?) => {
        /// Returns the opaque sibling of a format with an alpha channel.
        pub const fn opaque_substitute(fourcc: Fourcc) -> Option<Fourcc> {
            match fourcc {
                $($(Fourcc::$fourcc => Some(Fourcc::$opaque),)?)*
                _ => None,
            }
        }

        /// Returns the alpha-carrying sibling of an opaque format.
        pub const fn alpha_substitute(fourcc: Fourcc) -> Option<Fourcc> {
            match fourcc {
                $($(Fourcc::$opaque => Some(Fourcc::$fourcc),)?)*
                _ => None,
            }
        }

        /// Returns true if the format carries an alpha channel.
        pub const fn has_alpha(fourcc: Fourcc) -> bool {
            match fourcc {
                $(Fourcc::$fourcc => $alpha,)*
                _ => false,
            }
        }

        /// Bits per pixel of the format, if known.
        pub const fn bpp(fourcc: Fourcc) -> Option<u32> {
            match fourcc {
                $(Fourcc::$fourcc => Some($bpp),)*
                _ => None,
            }
        }

        /// Used bits per pixel of the format (padding and "X" channels
        /// excluded), if known.
        pub const fn depth(fourcc: Fourcc) -> Option<u32> {
            match fourcc {
                $(Fourcc::$fourcc => Some($depth),)*
                _ => None,
            }
        }

        #[cfg(test)]
        const KNOWN_FORMATS: &[Fourcc] = &[$(Fourcc::$fourcc,)*];
    };
}

format_table! {
    R8 { alpha: false, bpp: 8, depth: 8 },
    Rgb332 { alpha: false, bpp: 8, depth: 8 },
    Bgr233 { alpha: false, bpp: 8, depth: 8 },
    Argb4444 { opaque: Xrgb4444, alpha: true, bpp: 16, depth: 16 },
    Xrgb4444 { alpha: false, bpp: 16, depth: 12 },
    Abgr4444 { opaque: Xbgr4444, alpha: true, bpp: 16, depth: 16 },
    Xbgr4444 { alpha: false, bpp: 16, depth: 12 },
    Argb1555 { opaque: Xrgb1555, alpha: true, bpp: 16, depth: 16 },
    Xrgb1555 { alpha: false, bpp: 16, depth: 15 },
    Abgr1555 { opaque: Xbgr1555, alpha: true, bpp: 16, depth: 16 },
    Xbgr1555 { alpha: false, bpp: 16, depth: 15 },
    Rgb565 { alpha: false, bpp: 16, depth: 16 },
    Bgr565 { alpha: false, bpp: 16, depth: 16 },
    Rgb888 { alpha: false, bpp: 24, depth: 24 },
    Bgr888 { alpha: false, bpp: 24, depth: 24 },
    Argb8888 { opaque: Xrgb8888, alpha: true, bpp: 32, depth: 32 },
    Xrgb8888 { alpha: false, bpp: 32, depth: 24 },
    Abgr8888 { opaque: Xbgr8888, alpha: true, bpp: 32, depth: 32 },
    Xbgr8888 { alpha: false, bpp: 32, depth: 24 },
    Rgba8888 { opaque: Rgbx8888, alpha: true, bpp: 32, depth: 32 },
    Rgbx8888 { alpha: false, bpp: 32, depth: 24 },
    Bgra8888 { opaque: Bgrx8888, alpha: true, bpp: 32, depth: 32 },
    Bgrx8888 { alpha: false, bpp: 32, depth: 24 },
    Argb2101010 { opaque: Xrgb2101010, alpha: true, bpp: 32, depth: 32 },
    Xrgb2101010 { alpha: false, bpp: 32, depth: 30 },
    Abgr2101010 { opaque: Xbgr2101010, alpha: true, bpp: 32, depth: 32 },
    Xbgr2101010 { alpha: false, bpp: 32, depth: 30 },
    Argb16161616f { opaque: Xrgb16161616f, alpha: true, bpp: 64, depth: 64 },
    Xrgb16161616f { alpha: false, bpp: 64, depth: 48 },
    Abgr16161616f { opaque: Xbgr16161616f, alpha: true, bpp: 64, depth: 64 },
    Xbgr16161616f { alpha: false, bpp: 64, depth: 48 },
}

/// A shared set of [`Format`]s preserving insertion order.
#[derive(Debug, Default, Clone)]
pub struct FormatSet {
    formats: Arc<IndexSet<Format>>,
}

impl FormatSet {
    /// Returns `true` if the exact `(fourcc, modifier)` pair is present.
    pub fn contains(&self, format: &Format) -> bool {
        self.formats.contains(format)
    }

    /// Returns `true` if any entry uses the given fourcc.
    pub fn contains_fourcc(&self, fourcc: Fourcc) -> bool {
        self.formats.iter().any(|f| f.code == fourcc)
    }

    /// All modifiers present for the given fourcc, in set order.
    pub fn modifiers_for(&self, fourcc: Fourcc) -> impl Iterator<Item = Modifier> + '_ {
        self.formats.iter().filter(move |f| f.code == fourcc).map(|f| f.modifier)
    }

    /// Iterate the set in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Format> {
        self.formats.iter()
    }

    /// Number of `(fourcc, modifier)` pairs in the set.
    pub fn len(&self) -> usize {
        self.formats.len()
    }

    /// Returns `true` if the set is empty.
    pub fn is_empty(&self) -> bool {
        self.formats.is_empty()
    }

    /// Pairs present in both `self` and `other`, in `self`'s order.
    pub fn intersection<'a>(&'a self, other: &'a FormatSet) -> impl Iterator<Item = &'a Format> {
        self.formats.intersection(&other.formats)
    }
}

impl FromIterator<Format> for FormatSet {
    fn from_iter<T: IntoIterator<Item = Format>>(iter: T) -> Self {
        FormatSet {
            formats: Arc::new(IndexSet::from_iter(iter)),
        }
    }
}

impl IntoIterator for FormatSet {
    type Item = Format;
    type IntoIter = indexmap::set::IntoIter<Format>;

    fn into_iter(self) -> Self::IntoIter {
        (*self.formats).clone().into_iter()
    }
}

/// A growable list of `(fourcc, modifier)` pairs, used for the per-plane
/// sync-only blacklist discovered at runtime.
#[derive(Debug, Default, Clone)]
pub struct FormatList {
    formats: Vec<Format>,
}

impl FormatList {
    /// Returns `true` if the exact pair is present.
    pub fn contains(&self, format: &Format) -> bool {
        self.formats.contains(format)
    }

    /// Add the pair if not yet present.
    pub fn insert(&mut self, format: Format) {
        if !self.contains(&format) {
            self.formats.push(format);
        }
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.formats.len()
    }

    /// Returns `true` if nothing has been blacklisted.
    pub fn is_empty(&self) -> bool {
        self.formats.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opaque_substitute_differs() {
        for &format in KNOWN_FORMATS {
            if let Some(opaque) = opaque_substitute(format) {
                assert_ne!(format, opaque);
                assert_eq!(alpha_substitute(opaque), Some(format));
                // substitution keeps the memory layout
                assert_eq!(bpp(format), bpp(opaque));
                // only alpha formats get an opaque sibling, and that
                // sibling is terminal
                assert!(has_alpha(format));
                assert!(!has_alpha(opaque));
                assert!(opaque_substitute(opaque).is_none());
            }
        }
    }

    #[test]
    fn depth_not_above_bpp() {
        for &format in KNOWN_FORMATS {
            assert!(depth(format) <= bpp(format), "{} deeper than its bpp", format);
        }
    }

    #[test]
    fn set_intersection_preserves_order() {
        let a: FormatSet = [
            Format {
                code: Fourcc::Xrgb8888,
                modifier: Modifier::Linear,
            },
            Format {
                code: Fourcc::Argb8888,
                modifier: Modifier::Linear,
            },
            Format {
                code: Fourcc::Xrgb8888,
                modifier: Modifier::Invalid,
            },
        ]
        .into_iter()
        .collect();
        let b: FormatSet = [
            Format {
                code: Fourcc::Xrgb8888,
                modifier: Modifier::Invalid,
            },
            Format {
                code: Fourcc::Xrgb8888,
                modifier: Modifier::Linear,
            },
        ]
        .into_iter()
        .collect();

        let common: Vec<_> = a.intersection(&b).copied().collect();
        assert_eq!(common.len(), 2);
        assert_eq!(common[0].modifier, Modifier::Linear);
        assert!(a.contains_fourcc(Fourcc::Argb8888));
        assert!(!b.contains_fourcc(Fourcc::Argb8888));
        assert_eq!(b.modifiers_for(Fourcc::Xrgb8888).count(), 2);
    }

    #[test]
    fn blacklist_dedup() {
        let mut list = FormatList::default();
        let entry = Format {
            code: Fourcc::Xrgb8888,
            modifier: Modifier::from(0x0100_0000_0000_0001),
        };
        list.insert(entry);
        list.insert(entry);
        assert_eq!(list.len(), 1);
        assert!(list.contains(&entry));
    }
}
