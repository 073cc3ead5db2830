//! Class layout synthesis.
//!
//! A class layout is composed from its [`BaseOffsetTable`]: every direct
//! non-virtual base and every virtual base is embedded as a `super_` field
//! typed by the base's own layout, the class's member bytes are reserved as a
//! placeholder, and the virtual pointer and virtual-base pointer are dropped
//! in where the class owns them. Classes with virtual bases also get a
//! `<name>_nv` layout holding only their non-virtual part, which is the type
//! descendants embed.

use cxxray_types::{Layout, LayoutError, LayoutField};
use tracing::{debug, trace};

use crate::config::Abi;
use crate::error::{ModelError, ModelResult};
use crate::host::ClassModelStore;
use crate::model::{ClassId, ClassModel, ClassType};
use crate::offsets::BaseOffsetTable;

/// Name of the layout holding a class's non-virtual part.
pub fn non_virtual_name(class: &str) -> String {
    format!("{}_nv", class)
}

/// How one base is embedded.
#[derive(Debug, Clone)]
struct BasePart {
    offset: usize,
    name: String,
    layout_type: String,
    size: usize,
}

/// Builds and registers class layouts in a [`ClassModel`].
pub struct LayoutBuilder<'m> {
    model: &'m mut ClassModel,
}

impl<'m> LayoutBuilder<'m> {
    pub fn new(model: &'m mut ClassModel) -> Self {
        Self { model }
    }

    /// Builds the layout of `class`, building any missing base layout first.
    ///
    /// The result is registered under the class's type name. Nothing is
    /// registered unless every layout of the class composed. Building again
    /// without changing the class yields the same layout.
    pub fn build(&mut self, class: ClassId) -> ModelResult<Layout> {
        let table = self.model.base_offset_table(class)?.clone();
        let ty = self
            .model
            .get(class)
            .cloned()
            .ok_or(ModelError::UnknownClass(class))?;
        let type_name = self.type_name(class)?;

        let mut non_virtual = Vec::new();
        for entry in table.direct().filter(|e| !e.is_virtual) {
            non_virtual.push(self.base_part(entry.class, entry.offset)?);
        }
        let mut virtual_bases = Vec::new();
        for entry in table.virtual_bases() {
            virtual_bases.push(self.base_part(entry.class, entry.offset)?);
        }

        let abi = self.model.abi();
        let pointer_size = self.model.pointer_size();
        let to_model = |source: LayoutError| ModelError::Layout { class, source };

        let nv = if table.has_virtual_bases() {
            let start = self.start(&non_virtual_name(&type_name), table.nv_size, table.nv_align);
            let nv = compose(start, &ty, &table, &non_virtual, abi, pointer_size, table.nv_size)
                .map_err(to_model)?;
            Some(nv)
        } else {
            None
        };

        let mut parts = non_virtual;
        parts.extend(virtual_bases);
        let start = self.start(&type_name, table.size, table.align);
        let layout =
            compose(start, &ty, &table, &parts, abi, pointer_size, table.size).map_err(to_model)?;

        debug!(
            class = %type_name,
            fields = layout.fields.len(),
            size = layout.size,
            "built layout"
        );
        if let Some(nv) = nv {
            self.model.register_layout(class, nv);
        }
        self.model.register_layout(class, layout.clone());
        Ok(layout)
    }

    /// The layout of `class`, built only if none is registered yet.
    pub fn ensure(&mut self, class: ClassId) -> ModelResult<Layout> {
        match self.model.layout_of(class) {
            Some(layout) => Ok(layout.clone()),
            None => self.build(class),
        }
    }

    fn base_part(&mut self, base: ClassId, offset: usize) -> ModelResult<BasePart> {
        self.ensure(base)?;
        let name = self.type_name(base)?;
        let table = self.model.base_offset_table(base)?;
        let layout_type = if table.has_virtual_bases() {
            non_virtual_name(&name)
        } else {
            name.clone()
        };
        Ok(BasePart {
            offset,
            name,
            layout_type,
            size: table.nv_size,
        })
    }

    fn type_name(&self, class: ClassId) -> ModelResult<String> {
        self.model
            .type_name(class)
            .map(str::to_string)
            .ok_or(ModelError::UnknownClass(class))
    }

    /// The registered layout named `name`, or a fresh one.
    fn start(&self, name: &str, size: usize, align: usize) -> Layout {
        let mut layout = self
            .model
            .types()
            .get_layout(name)
            .cloned()
            .unwrap_or_else(|| Layout::new(name, size, align));
        layout.alignment = layout.alignment.max(align);
        layout
    }
}

fn compose(
    mut layout: Layout,
    ty: &ClassType,
    table: &BaseOffsetTable,
    bases: &[BasePart],
    abi: Abi,
    pointer_size: usize,
    size: usize,
) -> Result<Layout, LayoutError> {
    for base in bases {
        layout.replace_at_offset(LayoutField::base_as(
            &base.name,
            &base.layout_type,
            base.offset,
            base.size,
        ))?;
    }

    if let Some(offset) = table.vptr_offset {
        if table.owns_vptr || ty.is_polymorphic() {
            let field = LayoutField::vptr(abi.vptr_name(), offset, pointer_size, None);
            place_pointer(&mut layout, field)?;
        }
    }
    if table.owns_vbptr {
        if let Some(offset) = table.vbptr_offset {
            place_pointer(
                &mut layout,
                LayoutField::vbptr(abi.vbptr_name(), offset, pointer_size),
            )?;
        }
    }

    if ty.member_size > 0 {
        let start = table.members_offset;
        let end = start.saturating_add(ty.member_size);
        if !layout.fields.iter().any(|f| f.overlaps(start, end)) {
            layout.replace_at_offset(LayoutField::undefined(start, ty.member_size))?;
        }
    }

    layout.grow_to(size);
    Ok(layout)
}

/// Places a hidden pointer unless it would overwrite an inherited base field.
fn place_pointer(layout: &mut Layout, field: LayoutField) -> Result<(), LayoutError> {
    let end = field.end();
    let blocked = layout
        .fields
        .iter()
        .filter(|f| f.overlaps(field.offset, end))
        .any(|f| !f.is_undefined() && f.is_inherited());
    if blocked {
        trace!(field = %field.name, offset = field.offset, "kept inherited field");
        return Ok(());
    }
    layout.replace_at_offset(field)?;
    Ok(())
}
