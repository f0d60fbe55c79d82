//! Routines for parsing and reading structured data from resource forks
//!
//! ### Reference:
//!
//! [Inside Macintosh: More Macintosh Toolbox](https://archive.org/details/inside-macintosh-1992-1994/1993-more_macintosh_toolbox/)
//! Resource File Format 1-121 (pp. 151)

// Re: compressed resources: <http://preserve.mactech.com/articles/mactech/Vol.09/09.01/ResCompression/index.html>

use crate::binary::read::{
    CheckIndex, ReadArray, ReadBinary, ReadBinaryDep, ReadCtxt, ReadFrom, ReadScope,
};
use crate::binary::{I16Be, NumFrom, U16Be, U24Be, U32Be, U8};
use crate::error::{Error, ParseError};
use crate::macroman::FromMacRoman;
use crate::FourCC;

/// Below this size a resource fork cannot contain a valid 16-byte header
/// plus a non-empty map (the map header alone is 28 bytes); used to reject
/// obviously-truncated forks before handing them to the binary reader.
const MIN_RESOURCE_FORK_LEN: usize = 16 + 28;

/// A parsed resource fork.
pub struct ResourceFork<'a> {
    rsrc_data: &'a [u8],
    map: ResourceMap<'a>,
}

struct ResourceMap<'a> {
    attributes: u16,
    type_list: TypeList<'a>,
    name_list_scope: ReadScope<'a>,
}

struct TypeList<'a> {
    scope: ReadScope<'a>,
    list: ReadArray<'a, TypeListItem>,
}

#[derive(Copy, Clone)]
pub struct TypeListItem {
    /// Resource type
    rsrc_type: FourCC,
    /// Number of resources of this type
    num_rsrc: u16,
    /// Offset from the beginning of the resource type list to reference list for this type
    reference_list_offset: u16,
}

struct ReferenceList<'a> {
    list: ReadArray<'a, ReferenceListItem>,
}

struct ReferenceListItem {
    id: i16,
    /// Offset from beginning of resource name list to resource name
    name_offset: Option<u16>,
    attributes: u8,
    /// Offset from beginning of resource data to data for this resource
    data_offset: u32, // actually only 3 bytes
}

/// An individual resource from a resource fork.
pub struct Resource<'a> {
    id: i16,
    name: Option<&'a [u8]>,
    attributes: u8,
    data: &'a [u8],
}

/// An iterator over the resource types in a resource fork.
///
/// Typically created with [ResourceFork::resource_types].
pub struct ResourceTypes<'a, 'rsrc> {
    fork: &'a ResourceFork<'rsrc>,
    type_index: u16,
}

/// An iterator over the resources of a given type.
///
/// Typically created with [ResourceFork::resources].
pub struct Resources<'a, 'rsrc> {
    fork: &'a ResourceFork<'rsrc>,
    item: TypeListItem,
    rsrc_index: u16,
}

impl<'a> ResourceFork<'a> {
    /// Parses a resource fork already read into memory.
    ///
    /// Returns `Error::TooLarge` if `data` exceeds the 32 MiB ceiling this
    /// crate enforces on resource forks, and `Error::Invalid` if it's too
    /// short to hold a resource fork header plus a non-empty map, or if
    /// the header's own length fields don't fit inside `data`. Any other
    /// structural problem surfaces through the same `Error::Invalid`
    /// variant, wrapping the lower-level [`ParseError`].
    pub fn new(data: &[u8]) -> Result<ResourceFork<'_>, Error> {
        if data.len() > 32 * 1024 * 1024 {
            return Err(Error::TooLarge);
        }
        if data.len() < MIN_RESOURCE_FORK_LEN {
            return Err(Error::Invalid);
        }
        Self::parse(data).map_err(Error::from)
    }

    fn parse(data: &[u8]) -> Result<ResourceFork<'_>, ParseError> {
        let scope = ReadScope::new(data);
        let mut ctxt = scope.ctxt();
        let data_offset = ctxt.read_u32be()?;
        let map_offset = ctxt.read_u32be()?;
        let data_len = ctxt.read_u32be()?;
        let map_len = ctxt.read_u32be()?;

        let rsrc_data =
            scope.offset_length(usize::num_from(data_offset), usize::num_from(data_len))?;
        let map_data =
            scope.offset_length(usize::num_from(map_offset), usize::num_from(map_len))?;
        let rsrc_map = map_data.read::<ResourceMap>()?;

        Ok(ResourceFork {
            rsrc_data: rsrc_data.data(),
            map: rsrc_map,
        })
    }

    pub fn resource_types(&self) -> ResourceTypes<'_, 'a> {
        ResourceTypes {
            fork: self,
            type_index: 0,
        }
    }

    pub fn resources<'b>(&'b self, item: TypeListItem) -> Resources<'_, 'a> {
        Resources {
            fork: self,
            item,
            rsrc_index: 0,
        }
    }
}

impl ResourceFork<'_> {
    /// Looks up a single resource by type and id.
    ///
    /// Returns `Error::ResourceNotFound` if no resource of that type and id
    /// exists, or `Error::Invalid` if the map points at one but its data or
    /// name can't actually be read (a corrupt offset).
    pub fn get_resource(&self, rsrc_type: FourCC, rsrc_id: i16) -> Result<Resource<'_>, Error> {
        let reference_list = match self.map.type_list.find(rsrc_type) {
            None => return Err(Error::ResourceNotFound),
            Some(result) => result?,
        };
        let item = reference_list.find(rsrc_id).ok_or(Error::ResourceNotFound)?;
        self.read_resource(&item)
    }

    fn read_resource(&self, item: &ReferenceListItem) -> Result<Resource<'_>, Error> {
        let data = self.read_resource_data(item.data_offset)?;
        let name = item
            .name_offset
            .map(|offset| self.read_name(offset))
            .transpose()?;

        Ok(Resource {
            id: item.id,
            name,
            attributes: item.attributes,
            data,
        })
    }

    fn read_resource_data(&self, offset: u32) -> Result<&[u8], Error> {
        let mut ctxt = ReadScope::new(self.rsrc_data)
            .offset(usize::num_from(offset))
            .ctxt();
        let len = ctxt.read_u32be()?;
        Ok(ctxt.read_slice(usize::num_from(len))?)
    }

    fn read_name(&self, offset: u16) -> Result<&[u8], Error> {
        let mut ctxt = self.map.name_list_scope.offset(usize::from(offset)).ctxt();
        let len = ctxt.read_u8()?;
        Ok(ctxt.read_slice(usize::from(len))?)
    }
}

impl ReadBinary for ResourceMap<'_> {
    type HostType<'a> = ResourceMap<'a>;

    fn read<'a>(ctxt: &mut ReadCtxt<'a>) -> Result<Self::HostType<'a>, ParseError> {
        // Skip the first 22 bytes these are all set to 0 and are used by the Resource
        // Manager for storing data at runtime.
        let scope = ctxt.scope();
        let _ = ctxt.read_slice(16 + 4 + 2)?;
        let attributes = ctxt.read_u16be()?;
        let rsrc_type_list_offset = ctxt.read_u16be()?;
        let rsrc_name_list_offset = ctxt.read_u16be()?;

        let type_list = scope
            .offset(usize::from(rsrc_type_list_offset))
            .read::<TypeList<'_>>()?;
        let name_list_scope = scope.offset(usize::from(rsrc_name_list_offset));

        Ok(ResourceMap {
            attributes,
            type_list,
            name_list_scope,
        })
    }
}

impl ReadBinary for TypeList<'_> {
    type HostType<'a> = TypeList<'a>;

    fn read<'a>(ctxt: &mut ReadCtxt<'a>) -> Result<Self::HostType<'a>, ParseError> {
        let scope = ctxt.scope();
        // Value is stored minus 1, read as signed so the empty-list sentinel
        // (-1, i.e. 0xFFFF) yields 0 rather than overflowing a u16 add.
        let num_types = ctxt.read_i16be()?.wrapping_add(1).max(0) as usize;
        let list = ctxt.read_array::<TypeListItem>(num_types)?;

        Ok(TypeList { scope, list })
    }
}

impl TypeList<'_> {
    /// `None` if no entry has `rsrc_type`; `Some(Err(_))` if a matching
    /// entry's own reference list has a corrupt offset.
    fn find(&self, rsrc_type: FourCC) -> Option<Result<ReferenceList<'_>, ParseError>> {
        let item = self.list.iter().find(|item| item.rsrc_type == rsrc_type)?;
        Some(item.reference_list(self.scope))
    }
}

impl ReadFrom for TypeListItem {
    type ReadType = (FourCC, U16Be, U16Be);

    fn from((rsrc_type, num_rsrc, reference_list_offset): (FourCC, u16, u16)) -> Self {
        TypeListItem {
            rsrc_type,
            // Value is stored minus 1
            num_rsrc: num_rsrc.wrapping_add(1),
            reference_list_offset,
        }
    }
}

impl TypeListItem {
    pub fn resource_type(&self) -> FourCC {
        self.rsrc_type
    }

    fn reference_list<'a>(&self, scope: ReadScope<'a>) -> Result<ReferenceList<'a>, ParseError> {
        scope
            .offset(usize::from(self.reference_list_offset))
            .read_dep::<ReferenceList<'_>>(self.num_rsrc)
    }
}

impl ReadBinaryDep for ReferenceList<'_> {
    type Args<'a> = u16;
    type HostType<'a> = ReferenceList<'a>;

    fn read_dep<'a>(
        ctxt: &mut ReadCtxt<'a>,
        num_rsrc: u16,
    ) -> Result<Self::HostType<'a>, ParseError> {
        let list = ctxt.read_array::<ReferenceListItem>(usize::from(num_rsrc))?;
        Ok(ReferenceList { list })
    }
}

impl ReferenceList<'_> {
    fn find(&self, id: i16) -> Option<ReferenceListItem> {
        self.list.iter().find(|item| item.id == id)
    }
}

impl ReadFrom for ReferenceListItem {
    type ReadType = ((I16Be, I16Be, U8), U24Be, U32Be);

    fn from(
        ((id, name_offset, attributes), data_offset, _reserved): ((i16, i16, u8), u32, u32),
    ) -> Self {
        ReferenceListItem {
            id,
            name_offset: (name_offset >= 0).then_some(name_offset as u16),
            attributes,
            data_offset,
        }
    }
}

impl Resource<'_> {
    pub fn id(&self) -> i16 {
        self.id
    }

    /// The name associated with this resource, if present, converted from
    /// Mac OS Roman to UTF-8.
    pub fn name(&self) -> Option<String> {
        self.name.map(|name| String::from_macroman(name))
    }

    /// The raw bytes of the resource name.
    pub fn name_bytes(&self) -> Option<&[u8]> {
        self.name
    }

    pub fn data(&self) -> &[u8] {
        self.data
    }
}

impl<'a, 'rsrc> Iterator for ResourceTypes<'a, 'rsrc> {
    type Item = TypeListItem;

    fn next(&mut self) -> Option<Self::Item> {
        // Get the current type list
        let list = &self.fork.map.type_list.list;
        let type_list_item = list
            .check_index(usize::from(self.type_index))
            .ok()
            .map(|()| list.get_item(usize::from(self.type_index)))?;

        self.type_index += 1;
        Some(type_list_item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let num_remaining = self.fork.map.type_list.list.len() - usize::from(self.type_index);
        (num_remaining, Some(num_remaining))
    }
}

impl<'rsrc, 'a: 'rsrc> Iterator for Resources<'a, 'rsrc> {
    type Item = Resource<'rsrc>;

    fn next(&mut self) -> Option<Self::Item> {
        let reference_list = self.reference_list()?;
        let reference_list_item = reference_list
            .list
            .check_index(usize::from(self.rsrc_index))
            .ok()
            .map(|()| reference_list.list.get_item(usize::from(self.rsrc_index)))?;
        // A malformed individual resource just ends iteration early, rather
        // than surfacing `Error` from an `Iterator`; callers after a
        // specific resource should use `get_resource` instead.
        let resource = self.fork.read_resource(&reference_list_item).ok()?;

        self.rsrc_index += 1;
        Some(resource)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.reference_list()
            .map(|reference_list| {
                let num_remaining = reference_list.list.len() - usize::from(self.rsrc_index);
                (num_remaining, Some(num_remaining))
            })
            .unwrap_or((0, None))
    }
}

impl Resources<'_, '_> {
    /// A malformed reference list just ends iteration (see the `Iterator`
    /// impl above); callers after one specific resource should use
    /// `get_resource` instead, which surfaces the underlying error.
    fn reference_list(&self) -> Option<ReferenceList<'_>> {
        self.item.reference_list(self.fork.map.type_list.scope).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds a minimal resource fork with a single type ('TEST') holding
    /// one named resource, id 128, data `b"hello"`.
    fn build_fork() -> Vec<u8> {
        // Layout: 16-byte header, then data, then map.
        let name = b"greeting";
        let data_payload = b"hello";

        let mut data = Vec::new();
        data.extend_from_slice(&(data_payload.len() as u32).to_be_bytes());
        data.extend_from_slice(data_payload);

        let mut name_list = Vec::new();
        name_list.push(name.len() as u8);
        name_list.extend_from_slice(name);

        // Reference list: one entry. Layout is (id: I16Be, name_offset: I16Be,
        // attributes: U8, data_offset: U24Be, reserved: U32Be) = 12 bytes.
        let mut reference_list = Vec::new();
        reference_list.extend_from_slice(&128i16.to_be_bytes()); // id
        reference_list.extend_from_slice(&(-1i16).to_be_bytes()); // name offset: none
        reference_list.push(0); // attributes
        reference_list.extend_from_slice(&[0x00, 0x00, 0x00]); // data offset (3 bytes)
        reference_list.extend_from_slice(&[0u8; 4]); // reserved handle field

        // Type list: count-1, then one type entry.
        let mut type_list = Vec::new();
        type_list.extend_from_slice(&0u16.to_be_bytes()); // num_types - 1 == 0
        type_list.extend_from_slice(b"TEST");
        type_list.extend_from_slice(&0u16.to_be_bytes()); // num_rsrc - 1 == 0
        let reference_list_offset = (2 + 8) as u16; // after the count and one type entry
        type_list.extend_from_slice(&reference_list_offset.to_be_bytes());
        type_list.extend_from_slice(&reference_list);

        // Map header: 16 + 4 + 2 reserved bytes, then attributes (2) and the
        // two list offsets (2 each), all relative to the start of the map.
        let rsrc_type_list_offset = (16 + 4 + 2 + 2 + 2 + 2) as u16;
        let rsrc_name_list_offset = rsrc_type_list_offset + type_list.len() as u16;

        let mut map = Vec::new();
        map.extend_from_slice(&[0u8; 16]); // reserved handle fields
        map.extend_from_slice(&[0u8; 4]); // reserved next-map/file-ref placeholder
        map.extend_from_slice(&[0u8; 2]); // reserved
        map.extend_from_slice(&0u16.to_be_bytes()); // attributes
        map.extend_from_slice(&rsrc_type_list_offset.to_be_bytes());
        map.extend_from_slice(&rsrc_name_list_offset.to_be_bytes());
        map.extend_from_slice(&type_list);
        map.extend_from_slice(&name_list);

        let data_offset = 16u32;
        let map_offset = data_offset + data.len() as u32;

        let mut fork = Vec::new();
        fork.extend_from_slice(&data_offset.to_be_bytes());
        fork.extend_from_slice(&map_offset.to_be_bytes());
        fork.extend_from_slice(&(data.len() as u32).to_be_bytes());
        fork.extend_from_slice(&(map.len() as u32).to_be_bytes());
        fork.extend_from_slice(&data);
        fork.extend_from_slice(&map);
        fork
    }

    #[test]
    fn finds_resource_by_type_and_id() {
        let fork_bytes = build_fork();
        let fork = ResourceFork::new(&fork_bytes).unwrap();
        let resource = fork
            .get_resource(FourCC::from_bytes(*b"TEST"), 128)
            .unwrap();
        assert_eq!(resource.data(), b"hello");
        assert_eq!(resource.id(), 128);
    }

    #[test]
    fn missing_resource_reports_not_found() {
        let fork_bytes = build_fork();
        let fork = ResourceFork::new(&fork_bytes).unwrap();
        assert!(matches!(
            fork.get_resource(FourCC::from_bytes(*b"TEST"), 999),
            Err(Error::ResourceNotFound)
        ));
        assert!(matches!(
            fork.get_resource(FourCC::from_bytes(*b"NOPE"), 128),
            Err(Error::ResourceNotFound)
        ));
    }

    #[test]
    fn truncated_fork_is_invalid() {
        assert!(matches!(ResourceFork::new(&[0u8; 4]), Err(Error::Invalid)));
    }

    #[test]
    fn oversized_fork_is_rejected() {
        let big = vec![0u8; 32 * 1024 * 1024 + 1];
        assert!(matches!(ResourceFork::new(&big), Err(Error::TooLarge)));
    }

    #[test]
    fn iterates_resource_types() {
        let fork_bytes = build_fork();
        let fork = ResourceFork::new(&fork_bytes).unwrap();
        let types: Vec<_> = fork
            .resource_types()
            .map(|item| item.resource_type())
            .collect();
        assert_eq!(types, vec![FourCC::from_bytes(*b"TEST")]);
    }

    #[test]
    fn empty_type_list_sentinel_is_zero_types_not_overflow() {
        // num_types - 1 stored as 0xFFFF means zero types, not an overflow.
        let mut map = Vec::new();
        map.extend_from_slice(&[0u8; 16]);
        map.extend_from_slice(&[0u8; 4]);
        map.extend_from_slice(&[0u8; 2]);
        map.extend_from_slice(&0u16.to_be_bytes()); // attributes
        let rsrc_type_list_offset = (16 + 4 + 2 + 2 + 2 + 2) as u16;
        let rsrc_name_list_offset = rsrc_type_list_offset + 2;
        map.extend_from_slice(&rsrc_type_list_offset.to_be_bytes());
        map.extend_from_slice(&rsrc_name_list_offset.to_be_bytes());
        map.extend_from_slice(&0xFFFFu16.to_be_bytes()); // num_types - 1 == -1

        let data_offset = 16u32;
        let map_offset = data_offset;

        let mut fork = Vec::new();
        fork.extend_from_slice(&data_offset.to_be_bytes());
        fork.extend_from_slice(&map_offset.to_be_bytes());
        fork.extend_from_slice(&0u32.to_be_bytes());
        fork.extend_from_slice(&(map.len() as u32).to_be_bytes());
        fork.extend_from_slice(&map);

        let fork = ResourceFork::new(&fork).unwrap();
        assert_eq!(fork.resource_types().count(), 0);
    }
}
