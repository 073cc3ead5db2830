//! Base-offset resolution.
//!
//! For a class, computes where every base-class sub-object sits inside it.
//! The rules follow the common shape of both supported ABIs:
//!
//! - A primary base (the first non-virtual base that carries a virtual
//!   pointer) is placed at offset 0 and shares its virtual pointer.
//! - Otherwise a dynamic class reserves its own virtual pointer at 0.
//! - MSVC classes with virtual bases reserve a virtual-base pointer unless a
//!   non-virtual base already carries one.
//! - Remaining non-virtual bases follow in declaration order, each aligned,
//!   then the class's own members. A base whose offset was recorded by the
//!   type descriptor is placed there instead, and the gap before it counts
//!   as data of the preceding part.
//! - Every virtual base in the inheritance graph is placed exactly once after
//!   the non-virtual part, in depth-first declaration order.
//!
//! Empty classes occupy one byte; there is no empty-base optimisation.

use std::collections::{BTreeMap, HashMap, HashSet};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::config::Abi;
use crate::error::{ModelError, ModelResult};
use crate::model::{ClassId, ClassType};

/// One occurrence of a base class inside a derived class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseSubobject {
    /// The base class.
    pub class: ClassId,
    /// Byte offset within the derived class.
    pub offset: usize,
    /// This occurrence is a virtual base.
    pub is_virtual: bool,
    /// This occurrence lies inside a virtual base sub-object (or is one).
    pub in_virtual_base: bool,
    /// Inheritance paths reaching this occurrence, each starting at a direct
    /// base and ending at `class`. Virtual bases collect every path.
    pub paths: Vec<Vec<ClassId>>,
}

impl BaseSubobject {
    /// Whether the occurrence is a direct base.
    pub fn is_direct(&self) -> bool {
        self.paths.iter().any(|p| p.len() == 1)
    }

    /// Copy of this occurrence as seen from a class embedding the owner at `offset`.
    fn nested(&self, via: &[Vec<ClassId>], offset: usize, in_virtual_base: bool) -> Option<Self> {
        let paths = via
            .iter()
            .flat_map(|prefix| {
                self.paths.iter().map(move |suffix| {
                    let mut path = prefix.clone();
                    path.extend_from_slice(suffix);
                    path
                })
            })
            .collect();
        Some(Self {
            class: self.class,
            offset: offset.checked_add(self.offset)?,
            is_virtual: false,
            in_virtual_base,
            paths,
        })
    }
}

/// Where every base sub-object of one class sits, plus the class's sizes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseOffsetTable {
    /// The derived class.
    pub class: ClassId,
    /// Every base occurrence: non-virtual ones in declaration order
    /// (depth-first), then virtual bases with their contents.
    pub entries: Vec<BaseSubobject>,
    /// The primary base sharing the virtual pointer at offset 0.
    pub primary_base: Option<ClassId>,
    /// Offset of the virtual pointer, if the class is dynamic.
    pub vptr_offset: Option<usize>,
    /// The class places its own virtual pointer.
    pub owns_vptr: bool,
    /// Offset of the virtual-base pointer (MSVC only).
    pub vbptr_offset: Option<usize>,
    /// The class places its own virtual-base pointer.
    pub owns_vbptr: bool,
    /// Offset of the class's own data members.
    pub members_offset: usize,
    /// Size without virtual bases.
    pub nv_size: usize,
    /// Alignment without virtual bases.
    pub nv_align: usize,
    /// Complete-object size.
    pub size: usize,
    /// Complete-object alignment.
    pub align: usize,
}

impl BaseOffsetTable {
    /// Direct bases.
    pub fn direct(&self) -> impl Iterator<Item = &BaseSubobject> {
        self.entries.iter().filter(|e| e.is_direct())
    }

    /// Offset of direct base `class`.
    pub fn offset_of_direct(&self, class: ClassId) -> Option<usize> {
        self.direct().find(|e| e.class == class).map(|e| e.offset)
    }

    /// The direct base placed exactly at `offset`.
    pub fn direct_base_at(&self, offset: usize) -> Option<&BaseSubobject> {
        self.direct().find(|e| e.offset == offset)
    }

    /// Every occurrence of `class`.
    pub fn occurrences(&self, class: ClassId) -> Vec<&BaseSubobject> {
        self.entries.iter().filter(|e| e.class == class).collect()
    }

    /// Offset of the occurrence reached through `path`.
    pub fn offset_via(&self, path: &[ClassId]) -> Option<usize> {
        self.entries
            .iter()
            .find(|e| e.paths.iter().any(|p| p.as_slice() == path))
            .map(|e| e.offset)
    }

    /// Virtual base occurrences.
    pub fn virtual_bases(&self) -> impl Iterator<Item = &BaseSubobject> {
        self.entries.iter().filter(|e| e.is_virtual)
    }

    /// Whether the class has a virtual pointer.
    pub fn is_dynamic(&self) -> bool {
        self.vptr_offset.is_some()
    }

    /// Whether any virtual base exists anywhere in the hierarchy.
    pub fn has_virtual_bases(&self) -> bool {
        self.entries.iter().any(|e| e.is_virtual)
    }
}

fn align_up(value: usize, align: usize) -> Option<usize> {
    let align = align.max(1);
    value.checked_add(align - 1).map(|v| v / align * align)
}

/// Computes and memoizes [`BaseOffsetTable`]s.
///
/// Revisiting a class whose table is still being computed is reported as
/// [`ModelError::CyclicInheritance`]; nothing is memoized for a class whose
/// resolution failed.
pub struct OffsetResolver<'a> {
    classes: &'a BTreeMap<ClassId, ClassType>,
    abi: Abi,
    pointer_size: usize,
    in_progress: HashSet<ClassId>,
}

impl<'a> OffsetResolver<'a> {
    pub fn new(classes: &'a BTreeMap<ClassId, ClassType>, abi: Abi, pointer_size: usize) -> Self {
        Self {
            classes,
            abi,
            pointer_size,
            in_progress: HashSet::new(),
        }
    }

    /// Resolves `class` and, first, all of its bases into `memo`.
    pub fn resolve(
        &mut self,
        class: ClassId,
        memo: &mut HashMap<ClassId, BaseOffsetTable>,
    ) -> ModelResult<()> {
        if memo.contains_key(&class) {
            return Ok(());
        }
        if !self.in_progress.insert(class) {
            return Err(ModelError::CyclicInheritance(class));
        }
        let result = self.compute(class, memo);
        self.in_progress.remove(&class);

        let table = result?;
        trace!(
            class = %class,
            size = table.size,
            bases = table.entries.len(),
            "resolved base offsets"
        );
        memo.insert(class, table);
        Ok(())
    }

    fn compute(
        &mut self,
        id: ClassId,
        memo: &mut HashMap<ClassId, BaseOffsetTable>,
    ) -> ModelResult<BaseOffsetTable> {
        let classes = self.classes;
        let class = classes.get(&id).ok_or(ModelError::UnknownClass(id))?;
        for base in &class.bases {
            if !classes.contains_key(&base.class) {
                return Err(ModelError::UnknownClass(base.class));
            }
            self.resolve(base.class, memo)?;
        }

        let memo: &HashMap<ClassId, BaseOffsetTable> = memo;
        let table_of = |b: ClassId| memo.get(&b).ok_or(ModelError::UnknownClass(b));
        let overflow = || ModelError::OffsetOverflow(id);
        let ptr = self.pointer_size;

        let mut nv_tables = Vec::new();
        let mut recorded: HashMap<usize, usize> = HashMap::new();
        for (index, base) in class.bases.iter().enumerate() {
            if !base.is_virtual() {
                nv_tables.push((index, base.class, table_of(base.class)?));
                if let Some(offset) = base.offset {
                    recorded.insert(index, offset);
                }
            }
        }
        let mut has_virtual_bases = class.has_virtual_bases();
        let mut any_dynamic_base = false;
        for base in &class.bases {
            let table = table_of(base.class)?;
            has_virtual_bases |= table.has_virtual_bases();
            any_dynamic_base |= table.is_dynamic();
        }

        let primary = nv_tables
            .iter()
            .find(|(index, _, table)| {
                table.is_dynamic() && recorded.get(index).map_or(true, |&o| o == 0)
            })
            .map(|(index, class, _)| (*index, *class));
        let needs_vptr = match self.abi {
            Abi::Itanium => class.is_polymorphic() || has_virtual_bases || any_dynamic_base,
            Abi::Msvc => class.is_polymorphic(),
        };

        let mut cursor = 0usize;
        let mut align = 1usize;
        let mut placed: HashMap<usize, usize> = HashMap::new();
        let mut vptr_offset = None;
        let mut owns_vptr = false;

        if let Some((index, primary_class)) = primary {
            let table = table_of(primary_class)?;
            placed.insert(index, 0);
            cursor = table.nv_size;
            align = table.nv_align;
            vptr_offset = Some(0);
        } else if needs_vptr {
            vptr_offset = Some(0);
            owns_vptr = true;
            cursor = ptr;
            align = ptr;
        }

        let inherits_vbptr = nv_tables
            .iter()
            .any(|(_, _, table)| table.vbptr_offset.is_some());
        let mut vbptr_offset = None;
        let mut owns_vbptr = false;
        if self.abi.uses_vbptr() && has_virtual_bases && !inherits_vbptr {
            let offset = align_up(cursor, ptr).ok_or_else(overflow)?;
            vbptr_offset = Some(offset);
            owns_vbptr = true;
            cursor = offset.checked_add(ptr).ok_or_else(overflow)?;
            align = align.max(ptr);
        }

        for (index, _, table) in &nv_tables {
            if placed.contains_key(index) {
                continue;
            }
            let offset = match recorded.get(index) {
                Some(&offset) => offset,
                None => align_up(cursor, table.nv_align).ok_or_else(overflow)?,
            };
            let end = offset.checked_add(table.nv_size).ok_or_else(overflow)?;
            cursor = cursor.max(end);
            align = align.max(table.nv_align);
            placed.insert(*index, offset);
        }

        if vbptr_offset.is_none() && self.abi.uses_vbptr() {
            for (index, _, table) in &nv_tables {
                if let (Some(inner), Some(base_offset)) = (table.vbptr_offset, placed.get(index)) {
                    vbptr_offset = Some(base_offset.checked_add(inner).ok_or_else(overflow)?);
                    break;
                }
            }
        }

        let members_offset = if class.member_size > 0 {
            align_up(cursor, class.member_align).ok_or_else(overflow)?
        } else {
            cursor
        };
        cursor = members_offset
            .checked_add(class.member_size)
            .ok_or_else(overflow)?;
        if class.member_size > 0 {
            align = align.max(class.member_align);
        }

        let nv_align = align;
        let nv_size = align_up(cursor.max(1), nv_align).ok_or_else(overflow)?;

        // Non-virtual occurrences, in declaration order
        let mut entries = Vec::new();
        for (index, base_class, table) in &nv_tables {
            let offset = placed.get(index).copied().ok_or_else(overflow)?;
            let via = vec![vec![*base_class]];
            entries.push(BaseSubobject {
                class: *base_class,
                offset,
                is_virtual: false,
                in_virtual_base: false,
                paths: via.clone(),
            });
            for inner in table.entries.iter().filter(|e| !e.in_virtual_base) {
                entries.push(inner.nested(&via, offset, false).ok_or_else(overflow)?);
            }
        }

        // Virtual bases of the whole graph, first encounter wins the position
        let mut virtual_bases: IndexMap<ClassId, Vec<Vec<ClassId>>> = IndexMap::new();
        for base in &class.bases {
            if base.is_virtual() {
                virtual_bases
                    .entry(base.class)
                    .or_default()
                    .push(vec![base.class]);
            }
            for inner in table_of(base.class)?.virtual_bases() {
                let paths = virtual_bases.entry(inner.class).or_default();
                for suffix in &inner.paths {
                    let mut path = vec![base.class];
                    path.extend_from_slice(suffix);
                    if !paths.contains(&path) {
                        paths.push(path);
                    }
                }
            }
        }

        cursor = nv_size;
        align = nv_align;
        for (vbase, paths) in virtual_bases {
            let table = table_of(vbase)?;
            let offset = align_up(cursor, table.nv_align).ok_or_else(overflow)?;
            cursor = offset.checked_add(table.nv_size).ok_or_else(overflow)?;
            align = align.max(table.nv_align);
            entries.push(BaseSubobject {
                class: vbase,
                offset,
                is_virtual: true,
                in_virtual_base: true,
                paths: paths.clone(),
            });
            for inner in table.entries.iter().filter(|e| !e.in_virtual_base) {
                entries.push(inner.nested(&paths, offset, true).ok_or_else(overflow)?);
            }
        }
        let size = align_up(cursor.max(1), align).ok_or_else(overflow)?;

        Ok(BaseOffsetTable {
            class: id,
            entries,
            primary_base: primary.map(|(_, class)| class),
            vptr_offset,
            owns_vptr,
            vbptr_offset,
            owns_vbptr,
            members_offset,
            nv_size,
            nv_align,
            size,
            align,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::ClassModelStore;
    use crate::model::ClassModel;
    use crate::vtable::Vtable;

    const A: ClassId = ClassId(0xa0);
    const B: ClassId = ClassId(0xb0);
    const C: ClassId = ClassId(0xc0);
    const D: ClassId = ClassId(0xd0);

    fn vtable(owner: ClassId) -> Vtable {
        Vtable::from_targets(0x5000 + owner.0 * 0x10, owner.0, 8, [0x1000 + owner.0])
    }

    fn plain(id: ClassId, name: &str, size: usize) -> ClassType {
        ClassType::new(id, name).with_members(size, 1)
    }

    #[test]
    fn test_non_virtual_bases_follow_declaration_order() {
        let mut model = ClassModel::new(Abi::Itanium, 8);
        model.insert(plain(A, "A", 4));
        model.insert(plain(B, "B", 12));
        model.insert(plain(C, "C", 2).with_base(A).with_base(B));

        let table = model.base_offset_table(C).unwrap();
        assert_eq!(table.offset_of_direct(A), Some(0));
        assert_eq!(table.offset_of_direct(B), Some(4));
        assert_eq!(table.members_offset, 16);
        assert_eq!(table.size, 18);
        assert!(!table.is_dynamic());
    }

    #[test]
    fn test_recorded_offsets_override_placement() {
        let mut model = ClassModel::new(Abi::Itanium, 8);
        model.insert(ClassType::new(A, "A").with_vtable(vtable(A)));
        model.insert(ClassType::new(B, "B").with_vtable(vtable(B)));
        model.insert(
            ClassType::new(C, "C")
                .with_base_at(A, 0)
                .with_base_at(B, 24)
                .with_vtable(vtable(C)),
        );

        let table = model.base_offset_table(C).unwrap();
        assert_eq!(table.primary_base, Some(A));
        assert_eq!(table.offset_of_direct(A), Some(0));
        assert_eq!(table.offset_of_direct(B), Some(24));
        assert_eq!(table.members_offset, 32);
        assert_eq!(table.size, 32);
        assert_eq!(table.direct_base_at(24).unwrap().class, B);
    }

    #[test]
    fn test_recorded_offset_of_non_zero_dynamic_base_is_not_primary() {
        let mut model = ClassModel::new(Abi::Itanium, 8);
        model.insert(plain(A, "A", 4));
        model.insert(ClassType::new(B, "B").with_vtable(vtable(B)));
        model.insert(ClassType::new(C, "C").with_base_at(A, 8).with_base_at(B, 16));

        let table = model.base_offset_table(C).unwrap();
        assert_eq!(table.primary_base, None);
        assert!(table.owns_vptr);
        assert_eq!(table.offset_of_direct(A), Some(8));
        assert_eq!(table.offset_of_direct(B), Some(16));
        assert_eq!(table.size, 24);
    }

    #[test]
    fn test_polymorphic_class_reserves_vptr() {
        let mut model = ClassModel::new(Abi::Itanium, 8);
        model.insert(plain(A, "A", 4));
        model.insert(plain(B, "B", 4).with_base(A).with_vtable(vtable(B)));

        let table = model.base_offset_table(B).unwrap();
        assert!(table.owns_vptr);
        assert_eq!(table.vptr_offset, Some(0));
        assert_eq!(table.offset_of_direct(A), Some(8));
        assert_eq!(table.size, 16);
    }

    #[test]
    fn test_primary_base_shares_vptr() {
        let mut model = ClassModel::new(Abi::Itanium, 8);
        model.insert(plain(A, "A", 4));
        model.insert(plain(B, "B", 8).with_vtable(vtable(B)));
        model.insert(plain(C, "C", 0).with_base(A).with_base(B).with_vtable(vtable(C)));

        let table = model.base_offset_table(C).unwrap();
        assert_eq!(table.primary_base, Some(B));
        assert!(!table.owns_vptr);
        assert_eq!(table.offset_of_direct(B), Some(0));
        assert_eq!(table.offset_of_direct(A), Some(16));
        assert_eq!(table.direct_base_at(16).unwrap().class, A);
    }

    #[test]
    fn test_diamond_virtual_base_placed_once() {
        let mut model = ClassModel::new(Abi::Itanium, 8);
        model.insert(plain(A, "A", 4));
        model.insert(plain(B, "B", 4).with_virtual_base(A));
        model.insert(plain(C, "C", 4).with_virtual_base(A));
        model.insert(plain(D, "D", 4).with_base(B).with_base(C));

        let table = model.base_offset_table(D).unwrap();
        let a = table.occurrences(A);
        assert_eq!(a.len(), 1);
        assert!(a[0].is_virtual);
        assert_eq!(a[0].paths, vec![vec![B, A], vec![C, A]]);
        assert_eq!(table.offset_via(&[B, A]), table.offset_via(&[C, A]));
        assert!(table.offset_via(&[B, A]).unwrap() >= table.nv_size);
    }

    #[test]
    fn test_repeated_non_virtual_base_has_two_occurrences() {
        let mut model = ClassModel::new(Abi::Itanium, 8);
        model.insert(plain(A, "A", 4));
        model.insert(plain(B, "B", 4).with_base(A));
        model.insert(plain(C, "C", 4).with_base(A));
        model.insert(plain(D, "D", 0).with_base(B).with_base(C));

        let table = model.base_offset_table(D).unwrap();
        let offsets: Vec<_> = table.occurrences(A).iter().map(|e| e.offset).collect();
        assert_eq!(offsets, vec![0, 8]);
        assert_eq!(table.offset_via(&[C, A]), Some(8));
    }

    #[test]
    fn test_msvc_vbptr() {
        let mut model = ClassModel::new(Abi::Msvc, 8);
        model.insert(plain(A, "A", 4));
        model.insert(plain(B, "B", 4).with_virtual_base(A).with_vtable(vtable(B)));
        model.insert(plain(C, "C", 4).with_base(B));

        let b = model.base_offset_table(B).unwrap().clone();
        assert!(b.owns_vptr && b.owns_vbptr);
        assert_eq!(b.vbptr_offset, Some(8));

        let c = model.base_offset_table(C).unwrap();
        assert!(!c.owns_vbptr);
        assert_eq!(c.vbptr_offset, Some(8));
        assert_eq!(c.primary_base, Some(B));
    }

    #[test]
    fn test_itanium_virtual_base_makes_class_dynamic() {
        let mut model = ClassModel::new(Abi::Itanium, 8);
        model.insert(plain(A, "A", 4));
        model.insert(plain(B, "B", 4).with_virtual_base(A));

        let table = model.base_offset_table(B).unwrap();
        assert!(table.owns_vptr);
        assert_eq!(table.vbptr_offset, None);
        assert_eq!(table.nv_size, 16);
        assert_eq!(table.offset_of_direct(A), Some(16));
        assert_eq!(table.size, 24);
    }

    #[test]
    fn test_empty_class_occupies_one_byte() {
        let mut model = ClassModel::new(Abi::Itanium, 8);
        model.insert(ClassType::new(A, "A"));
        assert_eq!(model.base_offset_table(A).unwrap().size, 1);
    }

    #[test]
    fn test_cycle_is_rejected() {
        let mut model = ClassModel::new(Abi::Itanium, 8);
        model.insert(plain(A, "A", 4).with_base(B));
        model.insert(plain(B, "B", 4).with_base(A));

        let err = model.base_offset_table(A).unwrap_err();
        assert!(matches!(err, ModelError::CyclicInheritance(_)));
        assert!(model.cached_offsets(A).is_none());
        assert!(model.cached_offsets(B).is_none());
    }

    #[test]
    fn test_unknown_base_is_rejected() {
        let mut model = ClassModel::new(Abi::Itanium, 8);
        model.insert(plain(A, "A", 4).with_base(ClassId(0xdead)));
        assert_eq!(
            model.base_offset_table(A).unwrap_err(),
            ModelError::UnknownClass(ClassId(0xdead))
        );
    }
}
