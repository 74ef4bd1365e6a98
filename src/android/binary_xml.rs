//! Streaming decoder for Android binary XML (`AXML`) documents.
//!
//! [`BinaryXmlParser`] walks the chunk stream of a compiled resource XML file and
//! hands out pull-parser events. Nothing is materialized beyond the string pool,
//! the resource map and the attributes of the element the cursor sits on.
use log::debug;
use std::fmt;

const RES_XML_TYPE: u16 = 0x0003;
const RES_STRING_POOL_TYPE: u16 = 0x0001;
const RES_XML_RESOURCE_MAP_TYPE: u16 = 0x0180;
const RES_XML_START_NAMESPACE_TYPE: u16 = 0x0100;
const RES_XML_END_NAMESPACE_TYPE: u16 = 0x0101;
const RES_XML_START_ELEMENT_TYPE: u16 = 0x0102;
const RES_XML_END_ELEMENT_TYPE: u16 = 0x0103;
const RES_XML_CDATA_TYPE: u16 = 0x0104;

/// Size of `ResXMLTree_node`: chunk header, line number and comment index.
const XML_NODE_HEADER_SIZE: usize = 16;
const START_ELEMENT_EXT_SIZE: usize = 20;
const END_ELEMENT_EXT_SIZE: usize = 8;
const MIN_ATTRIBUTE_SIZE: usize = 20;

const NO_ENTRY_INDEX: u32 = 0xFFFF_FFFF;
const STRING_FLAG_UTF8: u32 = 0x0000_0100;

const TYPE_NULL: u8 = 0x00;
const TYPE_REFERENCE: u8 = 0x01;
const TYPE_STRING: u8 = 0x03;
const TYPE_FLOAT: u8 = 0x04;
const TYPE_INT_DEC: u8 = 0x10;
const TYPE_INT_HEX: u8 = 0x11;
const TYPE_INT_BOOLEAN: u8 = 0x12;

/// Framework attribute ids (`android.R.attr`) recognised when a document strips
/// attribute names from its string pool.
const FRAMEWORK_ATTRIBUTES: &[(u32, &str)] = &[
    (0x0101_0003, "name"),
    (0x0101_057a, "appComponentFactory"),
];

/// Result alias for binary XML operations.
pub type BinaryXmlResult<T> = Result<T, BinaryXmlError>;

/// Errors surfaced by the binary XML decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BinaryXmlError {
    /// The document is missing the expected structure.
    MalformedDocument(String),
}

impl BinaryXmlError {
    fn malformed(msg: impl Into<String>) -> Self {
        BinaryXmlError::MalformedDocument(msg.into())
    }
}

impl fmt::Display for BinaryXmlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BinaryXmlError::MalformedDocument(msg) => write!(f, "Malformed binary XML: {msg}"),
        }
    }
}

impl std::error::Error for BinaryXmlError {}

struct ChunkHeader {
    chunk_type: u16,
    header_size: u16,
    chunk_size: u32,
    start: usize,
}

impl ChunkHeader {
    fn end(&self) -> usize {
        self.start + self.chunk_size as usize
    }

    fn body_start(&self) -> usize {
        self.start + self.header_size as usize
    }
}

struct BinaryReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BinaryReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        BinaryReader { data, pos: 0 }
    }

    fn position(&self) -> usize {
        self.pos
    }

    fn read_u8(&mut self) -> BinaryXmlResult<u8> {
        if self.pos + 1 > self.data.len() {
            return Err(BinaryXmlError::malformed("Unexpected end of binary XML"));
        }
        let value = self.data[self.pos];
        self.pos += 1;
        Ok(value)
    }

    fn read_u16(&mut self) -> BinaryXmlResult<u16> {
        if self.pos + 2 > self.data.len() {
            return Err(BinaryXmlError::malformed("Unexpected end of binary XML"));
        }
        let value = u16::from_le_bytes([self.data[self.pos], self.data[self.pos + 1]]);
        self.pos += 2;
        Ok(value)
    }

    fn read_u32(&mut self) -> BinaryXmlResult<u32> {
        if self.pos + 4 > self.data.len() {
            return Err(BinaryXmlError::malformed("Unexpected end of binary XML"));
        }
        let value = u32::from_le_bytes([
            self.data[self.pos],
            self.data[self.pos + 1],
            self.data[self.pos + 2],
            self.data[self.pos + 3],
        ]);
        self.pos += 4;
        Ok(value)
    }

    fn seek(&mut self, offset: usize) -> BinaryXmlResult<()> {
        if offset > self.data.len() {
            return Err(BinaryXmlError::malformed(
                "Attempted to seek past end of document",
            ));
        }
        self.pos = offset;
        Ok(())
    }
}

/// Reads a chunk header at the cursor. The chunk must end at or before `limit`.
fn read_chunk_header(reader: &mut BinaryReader<'_>, limit: usize) -> BinaryXmlResult<ChunkHeader> {
    let start = reader.position();
    if limit.saturating_sub(start) < 8 {
        return Err(BinaryXmlError::malformed("Truncated binary XML chunk header"));
    }
    let chunk_type = reader.read_u16()?;
    let header_size = reader.read_u16()?;
    let chunk_size = reader.read_u32()?;
    if header_size < 8 || chunk_size < header_size as u32 {
        return Err(BinaryXmlError::malformed(format!(
            "Invalid chunk sizing (type 0x{chunk_type:04x}, header {header_size}, size {chunk_size})"
        )));
    }
    let end = start
        .checked_add(chunk_size as usize)
        .ok_or_else(|| BinaryXmlError::malformed("Chunk size overflow"))?;
    if end > limit {
        return Err(BinaryXmlError::malformed(format!(
            "Chunk 0x{chunk_type:04x} at 0x{start:x} extends past end of document"
        )));
    }
    Ok(ChunkHeader {
        chunk_type,
        header_size,
        chunk_size,
        start,
    })
}

struct StringPool {
    strings: Vec<String>,
}

impl StringPool {
    fn parse(reader: &mut BinaryReader<'_>, header: &ChunkHeader) -> BinaryXmlResult<Self> {
        let string_count = reader.read_u32()? as usize;
        let style_count = reader.read_u32()? as usize;
        let flags = reader.read_u32()?;
        let strings_start = reader.read_u32()? as usize;
        reader.read_u32()?; // stylesStart

        let is_utf8 = (flags & STRING_FLAG_UTF8) != 0;
        let chunk_end = header.end();

        // Every offset is four bytes; refuse counts the chunk cannot hold.
        let table_bytes = string_count
            .checked_add(style_count)
            .and_then(|count| count.checked_mul(4))
            .ok_or_else(|| BinaryXmlError::malformed("String pool count overflow"))?;
        reader.seek(header.body_start())?;
        if reader.position() + table_bytes > chunk_end {
            return Err(BinaryXmlError::malformed(
                "String pool offsets exceed chunk bounds",
            ));
        }

        let mut string_offsets = Vec::with_capacity(string_count);
        for _ in 0..string_count {
            string_offsets.push(reader.read_u32()? as usize);
        }

        let strings_base = header.start + strings_start;
        let mut strings = Vec::with_capacity(string_count);
        for offset in string_offsets {
            let absolute = strings_base + offset;
            let text = if is_utf8 {
                read_utf8_string(reader.data, absolute, chunk_end)?
            } else {
                read_utf16_string(reader.data, absolute, chunk_end)?
            };
            strings.push(text);
        }

        Ok(StringPool { strings })
    }

    /// Looks up a pool entry. `NO_ENTRY_INDEX` is a valid "no string" marker;
    /// any other index past the end of the pool is a decode error.
    fn get(&self, idx: u32) -> BinaryXmlResult<Option<&str>> {
        if idx == NO_ENTRY_INDEX {
            return Ok(None);
        }
        self.strings
            .get(idx as usize)
            .map(|s| Some(s.as_str()))
            .ok_or_else(|| {
                BinaryXmlError::malformed(format!(
                    "String index {idx} out of range (pool holds {})",
                    self.strings.len()
                ))
            })
    }

    fn require(&self, idx: u32, what: &str) -> BinaryXmlResult<&str> {
        self.get(idx)?
            .ok_or_else(|| BinaryXmlError::malformed(format!("{what} has no string reference")))
    }
}

fn read_utf8_string(data: &[u8], offset: usize, limit: usize) -> BinaryXmlResult<String> {
    let mut cursor = offset;
    if cursor >= limit {
        return Err(BinaryXmlError::malformed("String offset exceeds chunk bounds"));
    }
    // Character count first, then the encoded byte count.
    let (_, len_bytes) = read_utf8_length(data, cursor, limit)?;
    cursor += len_bytes;
    let (byte_len, byte_len_size) = read_utf8_length(data, cursor, limit)?;
    cursor += byte_len_size;
    if cursor + byte_len > limit {
        return Err(BinaryXmlError::malformed("UTF-8 string exceeds chunk bounds"));
    }
    let slice = &data[cursor..cursor + byte_len];
    let text = std::str::from_utf8(slice).map_err(|err| BinaryXmlError::malformed(err.to_string()))?;
    cursor += byte_len;
    if cursor >= limit {
        return Err(BinaryXmlError::malformed("Missing UTF-8 terminator"));
    }
    Ok(text.to_string())
}

fn read_utf16_string(data: &[u8], offset: usize, limit: usize) -> BinaryXmlResult<String> {
    let mut cursor = offset;
    let (char_count, header_bytes) = read_utf16_length(data, cursor, limit)?;
    cursor += header_bytes;
    let byte_len = char_count * 2;
    if cursor + byte_len > limit {
        return Err(BinaryXmlError::malformed("UTF-16 string exceeds chunk bounds"));
    }
    let units: Vec<u16> = data[cursor..cursor + byte_len]
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    cursor += byte_len;
    if cursor + 2 > limit {
        return Err(BinaryXmlError::malformed("Missing UTF-16 terminator"));
    }
    if data[cursor] != 0 || data[cursor + 1] != 0 {
        return Err(BinaryXmlError::malformed("UTF-16 string missing terminator"));
    }
    String::from_utf16(&units).map_err(|err| BinaryXmlError::malformed(err.to_string()))
}

fn read_utf8_length(data: &[u8], offset: usize, limit: usize) -> BinaryXmlResult<(usize, usize)> {
    if offset >= limit {
        return Err(BinaryXmlError::malformed("Invalid UTF-8 length offset"));
    }
    let first = data[offset];
    if (first & 0x80) == 0 {
        Ok((first as usize, 1))
    } else {
        if offset + 1 >= limit {
            return Err(BinaryXmlError::malformed("Truncated UTF-8 length"));
        }
        let second = data[offset + 1];
        let length = (((first & 0x7F) as usize) << 8) | second as usize;
        Ok((length, 2))
    }
}

fn read_utf16_length(data: &[u8], offset: usize, limit: usize) -> BinaryXmlResult<(usize, usize)> {
    if offset + 2 > limit {
        return Err(BinaryXmlError::malformed("Invalid UTF-16 length offset"));
    }
    let first = u16::from_le_bytes([data[offset], data[offset + 1]]);
    if (first & 0x8000) == 0 {
        Ok((first as usize, 2))
    } else {
        if offset + 4 > limit {
            return Err(BinaryXmlError::malformed("Truncated UTF-16 length"));
        }
        let second = u16::from_le_bytes([data[offset + 2], data[offset + 3]]);
        let length = (((first & 0x7FFF) as usize) << 16) | second as usize;
        Ok((length, 4))
    }
}

/// Typed attribute value as stored in a `Res_value`.
#[derive(Clone, Debug, PartialEq)]
pub enum AttributeValue {
    String(String),
    Boolean(bool),
    Integer(i32),
    Hex(u32),
    Float(f32),
    Reference(u32),
}

impl AttributeValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_reference_id(&self) -> Option<u32> {
        match self {
            AttributeValue::Reference(id) => Some(*id),
            _ => None,
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::String(text) => f.write_str(text),
            AttributeValue::Boolean(flag) => write!(f, "{flag}"),
            AttributeValue::Integer(num) => write!(f, "{num}"),
            AttributeValue::Hex(value) => write!(f, "0x{value:x}"),
            AttributeValue::Float(value) => write!(f, "{value}"),
            AttributeValue::Reference(id) => write!(f, "@0x{id:08x}"),
        }
    }
}

impl From<AttributeValue> for String {
    fn from(value: AttributeValue) -> Self {
        match value {
            AttributeValue::String(text) => text,
            other => other.to_string(),
        }
    }
}

fn decode_value(
    strings: &StringPool,
    raw_value_idx: u32,
    data_type: u8,
    data: u32,
) -> BinaryXmlResult<AttributeValue> {
    if let Some(raw) = strings.get(raw_value_idx)? {
        return Ok(AttributeValue::String(raw.to_string()));
    }

    match data_type {
        TYPE_NULL => Ok(AttributeValue::String(String::new())),
        TYPE_STRING => strings
            .require(data, "String value")
            .map(|s| AttributeValue::String(s.to_string())),
        TYPE_REFERENCE => Ok(AttributeValue::Reference(data)),
        TYPE_INT_BOOLEAN => Ok(AttributeValue::Boolean(data != 0)),
        TYPE_INT_DEC => Ok(AttributeValue::Integer(data as i32)),
        TYPE_INT_HEX => Ok(AttributeValue::Hex(data)),
        TYPE_FLOAT => Ok(AttributeValue::Float(f32::from_bits(data))),
        _ => Ok(AttributeValue::Hex(data)),
    }
}

/// Parser events, in document order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum XmlEvent {
    StartTag,
    EndTag,
    Text,
    EndDocument,
}

/// A pull-style source of XML events.
///
/// While positioned on [`XmlEvent::StartTag`] the attribute accessors describe
/// that tag's attributes in encoded order. On any other event the attribute
/// count is zero.
pub trait XmlEventSource {
    /// Advance to the next event. Once [`XmlEvent::EndDocument`] is returned,
    /// further calls keep returning it.
    fn next_event(&mut self) -> BinaryXmlResult<XmlEvent>;

    /// Local name of the current start or end tag.
    fn tag_name(&self) -> Option<&str>;

    fn attribute_count(&self) -> usize;

    /// Local name of attribute `index`, without namespace prefix.
    fn attribute_name(&self, index: usize) -> Option<&str>;

    fn attribute_value(&self, index: usize) -> BinaryXmlResult<AttributeValue>;
}

#[derive(Clone, Debug)]
struct RawAttribute {
    namespace_idx: u32,
    name_idx: u32,
    raw_value_idx: u32,
    data_type: u8,
    data: u32,
}

#[derive(Clone, Debug)]
struct CurrentNode {
    name_idx: u32,
    attributes: Vec<RawAttribute>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ParserState {
    Open,
    Finished,
}

/// Pull parser over an in-memory binary XML document.
pub struct BinaryXmlParser<'a> {
    reader: BinaryReader<'a>,
    document_end: usize,
    strings: Option<StringPool>,
    resource_map: Vec<u32>,
    depth: usize,
    current: Option<CurrentNode>,
    state: ParserState,
}

impl<'a> BinaryXmlParser<'a> {
    /// Validate the document header and position the cursor on the first chunk.
    pub fn open(data: &'a [u8]) -> BinaryXmlResult<Self> {
        let mut reader = BinaryReader::new(data);
        let xml_header = read_chunk_header(&mut reader, data.len())?;
        if xml_header.chunk_type != RES_XML_TYPE {
            return Err(BinaryXmlError::malformed(format!(
                "Binary XML does not start with RES_XML_TYPE header (found 0x{:04x})",
                xml_header.chunk_type
            )));
        }
        reader.seek(xml_header.body_start())?;
        Ok(BinaryXmlParser {
            reader,
            document_end: xml_header.end(),
            strings: None,
            resource_map: Vec::new(),
            depth: 0,
            current: None,
            state: ParserState::Open,
        })
    }

    /// Element nesting depth at the cursor; the root start tag is depth 1.
    #[cfg(test)]
    pub(crate) fn depth(&self) -> usize {
        self.depth
    }

    /// Namespace URI of attribute `index` on the current start tag, if any.
    #[cfg(test)]
    pub(crate) fn attribute_namespace(&self, index: usize) -> Option<&str> {
        let attribute = self.current.as_ref()?.attributes.get(index)?;
        self.strings.as_ref()?.get(attribute.namespace_idx).ok().flatten()
    }

    /// Resource id the string pool maps attribute `index` to, if any.
    #[cfg(test)]
    pub(crate) fn attribute_resource_id(&self, index: usize) -> Option<u32> {
        let attribute = self.current.as_ref()?.attributes.get(index)?;
        self.resource_map
            .get(attribute.name_idx as usize)
            .copied()
            .filter(|id| *id != 0)
    }

    fn pool(&self, what: &str) -> BinaryXmlResult<&StringPool> {
        self.strings.as_ref().ok_or_else(|| {
            BinaryXmlError::malformed(format!("{what} encountered before string pool"))
        })
    }

    fn read_start_element(&mut self, header: &ChunkHeader) -> BinaryXmlResult<()> {
        // Line number and comment index are not needed.
        let ext_start = header.start + XML_NODE_HEADER_SIZE;
        if ext_start + START_ELEMENT_EXT_SIZE > header.end() {
            return Err(BinaryXmlError::malformed("Start element chunk is too short"));
        }
        self.reader.seek(ext_start)?;
        self.reader.read_u32()?; // namespace
        let name_idx = self.reader.read_u32()?;
        let attribute_start = self.reader.read_u16()? as usize;
        let attribute_size = self.reader.read_u16()? as usize;
        let attribute_count = self.reader.read_u16()? as usize;

        let pool = self.pool("Start element")?;
        pool.require(name_idx, "Element name")?;

        if attribute_count > 0 && attribute_size < MIN_ATTRIBUTE_SIZE {
            return Err(BinaryXmlError::malformed(format!(
                "Attribute size {attribute_size} is smaller than {MIN_ATTRIBUTE_SIZE}"
            )));
        }
        let attributes_base = ext_start + attribute_start;
        if attributes_base + attribute_count * attribute_size > header.end() {
            return Err(BinaryXmlError::malformed(
                "Attributes extend past end of element chunk",
            ));
        }

        let mut attributes = Vec::with_capacity(attribute_count);
        for index in 0..attribute_count {
            self.reader.seek(attributes_base + index * attribute_size)?;
            let namespace_idx = self.reader.read_u32()?;
            let attr_name_idx = self.reader.read_u32()?;
            let raw_value_idx = self.reader.read_u32()?;
            let value_size = self.reader.read_u16()?;
            self.reader.read_u8()?; // res0
            let data_type = self.reader.read_u8()?;
            let data = self.reader.read_u32()?;
            if value_size != 8 {
                return Err(BinaryXmlError::malformed("Attribute value size must be 8"));
            }
            self.pool("Attribute")?.get(attr_name_idx)?;
            attributes.push(RawAttribute {
                namespace_idx,
                name_idx: attr_name_idx,
                raw_value_idx,
                data_type,
                data,
            });
        }

        self.depth += 1;
        self.current = Some(CurrentNode {
            name_idx,
            attributes,
        });
        Ok(())
    }

    fn read_end_element(&mut self, header: &ChunkHeader) -> BinaryXmlResult<()> {
        let ext_start = header.start + XML_NODE_HEADER_SIZE;
        if ext_start + END_ELEMENT_EXT_SIZE > header.end() {
            return Err(BinaryXmlError::malformed("End element chunk is too short"));
        }
        self.reader.seek(ext_start)?;
        self.reader.read_u32()?; // namespace
        let name_idx = self.reader.read_u32()?;
        self.pool("End element")?.require(name_idx, "Element name")?;
        if self.depth == 0 {
            return Err(BinaryXmlError::malformed(
                "End element without matching start",
            ));
        }
        self.depth -= 1;
        self.current = Some(CurrentNode {
            name_idx,
            attributes: Vec::new(),
        });
        Ok(())
    }

    fn read_resource_map(&mut self, header: &ChunkHeader) -> BinaryXmlResult<()> {
        self.reader.seek(header.body_start())?;
        let mut ids = Vec::with_capacity((header.end() - header.body_start()) / 4);
        while self.reader.position() + 4 <= header.end() {
            ids.push(self.reader.read_u32()?);
        }
        self.resource_map = ids;
        Ok(())
    }
}

impl XmlEventSource for BinaryXmlParser<'_> {
    fn next_event(&mut self) -> BinaryXmlResult<XmlEvent> {
        if self.state == ParserState::Finished {
            return Ok(XmlEvent::EndDocument);
        }
        self.current = None;

        while self.reader.position() < self.document_end {
            let header = read_chunk_header(&mut self.reader, self.document_end)?;
            let event = match header.chunk_type {
                RES_STRING_POOL_TYPE => {
                    self.strings = Some(StringPool::parse(&mut self.reader, &header)?);
                    None
                }
                RES_XML_RESOURCE_MAP_TYPE => {
                    self.read_resource_map(&header)?;
                    None
                }
                RES_XML_START_NAMESPACE_TYPE | RES_XML_END_NAMESPACE_TYPE => None,
                RES_XML_START_ELEMENT_TYPE => {
                    self.read_start_element(&header)?;
                    Some(XmlEvent::StartTag)
                }
                RES_XML_END_ELEMENT_TYPE => {
                    self.read_end_element(&header)?;
                    Some(XmlEvent::EndTag)
                }
                RES_XML_CDATA_TYPE => {
                    if self.depth == 0 {
                        return Err(BinaryXmlError::malformed("CDATA outside of any element"));
                    }
                    Some(XmlEvent::Text)
                }
                // Unknown chunk type; skip over it for forward compatibility.
                other => {
                    debug!(
                        "Skipping unknown chunk type 0x{other:04x} at 0x{:x}",
                        header.start
                    );
                    None
                }
            };
            self.reader.seek(header.end())?;
            if let Some(event) = event {
                return Ok(event);
            }
        }

        if self.depth != 0 {
            return Err(BinaryXmlError::malformed(format!(
                "{} unclosed element(s) at end of document",
                self.depth
            )));
        }
        self.state = ParserState::Finished;
        Ok(XmlEvent::EndDocument)
    }

    fn tag_name(&self) -> Option<&str> {
        let node = self.current.as_ref()?;
        self.strings.as_ref()?.get(node.name_idx).ok().flatten()
    }

    fn attribute_count(&self) -> usize {
        self.current
            .as_ref()
            .map_or(0, |node| node.attributes.len())
    }

    fn attribute_name(&self, index: usize) -> Option<&str> {
        let attribute = self.current.as_ref()?.attributes.get(index)?;
        match self.strings.as_ref()?.get(attribute.name_idx).ok().flatten() {
            Some(name) if !name.is_empty() => Some(name),
            // Stripped names: recover the framework attribute from its resource id.
            _ => {
                let id = self.resource_map.get(attribute.name_idx as usize)?;
                FRAMEWORK_ATTRIBUTES
                    .iter()
                    .find(|(known, _)| known == id)
                    .map(|(_, name)| *name)
            }
        }
    }

    fn attribute_value(&self, index: usize) -> BinaryXmlResult<AttributeValue> {
        let attribute = self
            .current
            .as_ref()
            .and_then(|node| node.attributes.get(index))
            .ok_or_else(|| {
                BinaryXmlError::malformed(format!("No attribute at index {index}"))
            })?;
        decode_value(
            self.pool("Attribute value")?,
            attribute.raw_value_idx,
            attribute.data_type,
            attribute.data,
        )
    }
}
