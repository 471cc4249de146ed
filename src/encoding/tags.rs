//! Tag streams
//!
//! A property value is carried on the wire as a flat run of tags whose opening
//! and closing markers nest like parentheses. [`parse`] turns such a run into a
//! [`TagList`] and rejects anything that does not nest; [`serialize`] is its
//! exact inverse for streams written with minimal headers.

use bytes::Bytes;

use super::{decode_tag, encode_tag, encode_tag_number, ApplicationTag, EncodingError, Result};

/// Class of a tag element
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagClass {
    Application,
    Context,
    Opening,
    Closing,
}

/// One element of a tag stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tag {
    /// Start of a constructed group
    Opening { context: u8 },
    /// End of a constructed group
    Closing { context: u8 },
    /// Context-specific primitive value
    Context { context: u8, data: Bytes },
    /// Application-tagged primitive value. A Boolean keeps its value as a
    /// single content octet even though the wire form carries it in the header.
    Application { tag: u8, data: Bytes },
}

impl Tag {
    /// Context tag from raw content octets
    pub fn context(context: u8, data: impl Into<Bytes>) -> Self {
        Tag::Context {
            context,
            data: data.into(),
        }
    }

    /// Application tag from raw content octets
    pub fn application(tag: ApplicationTag, data: impl Into<Bytes>) -> Self {
        Tag::Application {
            tag: tag as u8,
            data: data.into(),
        }
    }

    pub fn class(&self) -> TagClass {
        match self {
            Tag::Opening { .. } => TagClass::Opening,
            Tag::Closing { .. } => TagClass::Closing,
            Tag::Context { .. } => TagClass::Context,
            Tag::Application { .. } => TagClass::Application,
        }
    }

    /// Context number for opening, closing and context tags
    pub fn context_number(&self) -> Option<u8> {
        match self {
            Tag::Opening { context } | Tag::Closing { context } | Tag::Context { context, .. } => {
                Some(*context)
            }
            Tag::Application { .. } => None,
        }
    }

    /// Content octets (empty for opening/closing tags)
    pub fn data(&self) -> &[u8] {
        match self {
            Tag::Context { data, .. } | Tag::Application { data, .. } => data,
            Tag::Opening { .. } | Tag::Closing { .. } => &[],
        }
    }

    /// Check class and context number in one go
    pub fn is(&self, class: TagClass, context: u8) -> bool {
        self.class() == class && self.context_number() == Some(context)
    }

    /// Append the wire form of this tag
    pub fn encode(&self, buffer: &mut Vec<u8>) -> Result<()> {
        match self {
            Tag::Opening { context } => encode_tag_number(buffer, *context, true, 6),
            Tag::Closing { context } => encode_tag_number(buffer, *context, true, 7),
            Tag::Context { context, data } => {
                encode_tag(buffer, *context, true, data.len())?;
                buffer.extend_from_slice(data);
                Ok(())
            }
            Tag::Application { tag, data } if *tag == ApplicationTag::Boolean as u8 => {
                match data.as_ref() {
                    [value @ (0 | 1)] => encode_tag_number(buffer, *tag, false, *value),
                    _ => Err(EncodingError::InvalidFormat(
                        "boolean tag must hold a single 0/1 octet".into(),
                    )),
                }
            }
            Tag::Application { tag, data } => {
                encode_tag(buffer, *tag, false, data.len())?;
                buffer.extend_from_slice(data);
                Ok(())
            }
        }
    }
}

/// Ordered sequence of tags
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagList {
    tags: Vec<Tag>,
}

impl TagList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, tag: Tag) {
        self.tags.push(tag);
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Tag> {
        self.tags.iter()
    }

    pub fn as_slice(&self) -> &[Tag] {
        &self.tags
    }

    /// Cursor positioned at the first tag
    pub fn cursor(&self) -> TagCursor<'_> {
        TagCursor::new(&self.tags)
    }

    /// Parse a raw tag stream
    pub fn parse(data: &[u8]) -> Result<Self> {
        parse(data)
    }

    /// Wire form of the whole list
    pub fn encode(&self) -> Result<Vec<u8>> {
        serialize(self)
    }

    /// Verify that opening and closing tags nest
    pub fn check_nesting(&self) -> Result<()> {
        let mut open = Vec::new();
        for tag in &self.tags {
            match tag {
                Tag::Opening { context } => open.push(*context),
                Tag::Closing { context } => close_group(&mut open, *context)?,
                _ => {}
            }
        }
        unclosed(&open)
    }
}

impl From<Vec<Tag>> for TagList {
    fn from(tags: Vec<Tag>) -> Self {
        Self { tags }
    }
}

impl FromIterator<Tag> for TagList {
    fn from_iter<I: IntoIterator<Item = Tag>>(iter: I) -> Self {
        Self {
            tags: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for TagList {
    type Item = Tag;
    type IntoIter = std::vec::IntoIter<Tag>;

    fn into_iter(self) -> Self::IntoIter {
        self.tags.into_iter()
    }
}

impl<'a> IntoIterator for &'a TagList {
    type Item = &'a Tag;
    type IntoIter = std::slice::Iter<'a, Tag>;

    fn into_iter(self) -> Self::IntoIter {
        self.tags.iter()
    }
}

fn close_group(open: &mut Vec<u8>, context: u8) -> Result<()> {
    match open.pop() {
        Some(innermost) if innermost == context => Ok(()),
        Some(innermost) => Err(EncodingError::MalformedTag(format!(
            "closing tag {} while {} is open",
            context, innermost
        ))),
        None => Err(EncodingError::MalformedTag(format!(
            "closing tag {} without a matching opening tag",
            context
        ))),
    }
}

fn unclosed(open: &[u8]) -> Result<()> {
    match open.last() {
        Some(context) => Err(EncodingError::MalformedTag(format!(
            "opening tag {} is never closed",
            context
        ))),
        None => Ok(()),
    }
}

/// Parse a raw tag stream, enforcing that opening and closing tags nest
pub fn parse(data: &[u8]) -> Result<TagList> {
    let mut tags = Vec::new();
    let mut open = Vec::new();
    let mut pos = 0;

    while pos < data.len() {
        let (header, consumed) = decode_tag(&data[pos..]).map_err(|e| match e {
            EncodingError::UnexpectedEndOfData => {
                EncodingError::MalformedTag(format!("truncated tag header at offset {}", pos))
            }
            other => other,
        })?;
        pos += consumed;

        let tag = if header.is_opening() {
            open.push(header.number);
            Tag::Opening { context: header.number }
        } else if header.is_closing() {
            close_group(&mut open, header.number)?;
            Tag::Closing { context: header.number }
        } else if !header.context && header.number == ApplicationTag::Boolean as u8 {
            if header.lvt > 1 {
                return Err(EncodingError::InvalidFormat(format!(
                    "boolean value {} at offset {}",
                    header.lvt, pos
                )));
            }
            Tag::Application {
                tag: header.number,
                data: Bytes::copy_from_slice(&[header.lvt as u8]),
            }
        } else {
            let end = pos
                .checked_add(header.lvt as usize)
                .filter(|end| *end <= data.len())
                .ok_or_else(|| {
                    EncodingError::MalformedTag(format!(
                        "tag at offset {} claims {} octets past the end",
                        pos, header.lvt
                    ))
                })?;
            let content = Bytes::copy_from_slice(&data[pos..end]);
            pos = end;
            if header.context {
                Tag::Context {
                    context: header.number,
                    data: content,
                }
            } else {
                Tag::Application {
                    tag: header.number,
                    data: content,
                }
            }
        };
        tags.push(tag);
    }

    unclosed(&open)?;
    Ok(TagList { tags })
}

/// Serialize a tag list; fails if its opening and closing tags do not nest
pub fn serialize(list: &TagList) -> Result<Vec<u8>> {
    list.check_nesting()?;
    let mut buffer = Vec::with_capacity(list.len() * 3);
    for tag in list {
        tag.encode(&mut buffer)?;
    }
    Ok(buffer)
}

/// Read position over a borrowed run of tags
#[derive(Debug, Clone)]
pub struct TagCursor<'a> {
    tags: &'a [Tag],
    position: usize,
}

impl<'a> TagCursor<'a> {
    pub fn new(tags: &'a [Tag]) -> Self {
        Self { tags, position: 0 }
    }

    pub fn peek(&self) -> Option<&'a Tag> {
        self.tags.get(self.position)
    }

    pub fn pop(&mut self) -> Option<&'a Tag> {
        let tag = self.tags.get(self.position)?;
        self.position += 1;
        Some(tag)
    }

    pub fn peek_class(&self) -> Option<TagClass> {
        self.peek().map(Tag::class)
    }

    pub fn peek_context(&self) -> Option<u8> {
        self.peek().and_then(Tag::context_number)
    }

    /// Index of the next tag
    pub fn position(&self) -> usize {
        self.position
    }

    pub fn is_empty(&self) -> bool {
        self.position >= self.tags.len()
    }

    /// Tags not yet consumed
    pub fn remaining(&self) -> &'a [Tag] {
        &self.tags[self.position.min(self.tags.len())..]
    }

    /// Pop a context tag with the given number and return its content
    pub fn expect_context(&mut self, context: u8) -> Result<&'a [u8]> {
        match self.peek() {
            Some(tag @ Tag::Context { .. }) if tag.context_number() == Some(context) => {
                self.position += 1;
                Ok(tag.data())
            }
            other => Err(unexpected(other, &format!("context tag {}", context))),
        }
    }

    /// Pop an optional context tag with the given number
    pub fn optional_context(&mut self, context: u8) -> Option<&'a [u8]> {
        self.expect_context(context).ok()
    }

    /// Pop `Opening{context}` and everything up to its matching `Closing{context}`,
    /// returning the tags in between
    pub fn take_group(&mut self, context: u8) -> Result<TagList> {
        match self.peek() {
            Some(Tag::Opening { context: c }) if *c == context => {}
            other => return Err(unexpected(other, &format!("opening tag {}", context))),
        }
        let start = self.position + 1;
        let mut depth = 0usize;
        for (offset, tag) in self.tags[start..].iter().enumerate() {
            match tag {
                Tag::Opening { .. } => depth += 1,
                Tag::Closing { context: c } if depth == 0 => {
                    if *c != context {
                        return Err(EncodingError::MalformedTag(format!(
                            "closing tag {} while {} is open",
                            c, context
                        )));
                    }
                    let end = start + offset;
                    self.position = end + 1;
                    return Ok(TagList::from(self.tags[start..end].to_vec()));
                }
                Tag::Closing { .. } => depth -= 1,
                _ => {}
            }
        }
        Err(EncodingError::MalformedTag(format!(
            "opening tag {} is never closed",
            context
        )))
    }
}

fn unexpected(found: Option<&Tag>, wanted: &str) -> EncodingError {
    match found {
        Some(tag) => EncodingError::InvalidFormat(format!("expected {}, found {:?}", wanted, tag)),
        None => EncodingError::InvalidFormat(format!("expected {}, found end of stream", wanted)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_stream() -> Vec<u8> {
        // Open(1) ctx0 9ca4, ctx3 "\0" + "0.0.0.0", ctx17 00, Close(1)
        let mut bytes = vec![0x1E, 0x0A, 0x9C, 0xA4, 0x3D, 0x08, 0x00];
        bytes.extend_from_slice(b"0.0.0.0");
        bytes.extend_from_slice(&[0xF9, 0x11, 0x00, 0x1F]);
        bytes
    }

    #[test]
    fn test_parse_nested_stream() {
        let list = parse(&sample_stream()).unwrap();
        assert_eq!(list.len(), 5);
        assert_eq!(list.as_slice()[0], Tag::Opening { context: 1 });
        assert_eq!(list.as_slice()[1], Tag::context(0, vec![0x9C, 0xA4]));
        assert_eq!(list.as_slice()[2].data()[1..], *b"0.0.0.0");
        assert_eq!(list.as_slice()[3], Tag::context(17, vec![0x00]));
        assert_eq!(list.as_slice()[4], Tag::Closing { context: 1 });
    }

    #[test]
    fn test_serialize_is_inverse_of_parse() {
        let bytes = sample_stream();
        let list = parse(&bytes).unwrap();
        assert_eq!(serialize(&list).unwrap(), bytes);
    }

    #[test]
    fn test_six_and_seven_octet_context_tags() {
        let mut bytes = vec![0x0E, 0x2D, 0x06, 192, 168, 1, 10, 0xBA, 0xC0];
        bytes.extend_from_slice(&[0x3D, 0x07, 1, 2, 3, 4, 5, 6, 7, 0x0F]);
        let list = parse(&bytes).unwrap();
        assert_eq!(
            list.as_slice(),
            &[
                Tag::Opening { context: 0 },
                Tag::context(2, vec![192, 168, 1, 10, 0xBA, 0xC0]),
                Tag::context(3, vec![1, 2, 3, 4, 5, 6, 7]),
                Tag::Closing { context: 0 },
            ]
        );
        assert_eq!(serialize(&list).unwrap(), bytes);

        let list = TagList::from(vec![
            Tag::Opening { context: 0 },
            Tag::context(0, vec![0u8; 6]),
            Tag::Closing { context: 0 },
        ]);
        assert_eq!(parse(&serialize(&list).unwrap()).unwrap(), list);
    }

    #[test]
    fn test_mismatched_closing_tag() {
        let err = parse(&[0x0E, 0x1F]).unwrap_err();
        assert!(matches!(err, EncodingError::MalformedTag(_)));
    }

    #[test]
    fn test_crossed_groups() {
        // Open(0) Open(1) Close(0) Close(1)
        let err = parse(&[0x0E, 0x1E, 0x0F, 0x1F]).unwrap_err();
        assert!(matches!(err, EncodingError::MalformedTag(_)));
    }

    #[test]
    fn test_unclosed_group() {
        let err = parse(&[0x0E, 0x09, 0x01]).unwrap_err();
        assert!(matches!(err, EncodingError::MalformedTag(_)));
    }

    #[test]
    fn test_closing_without_opening() {
        let err = parse(&[0x09, 0x01, 0x0F]).unwrap_err();
        assert!(matches!(err, EncodingError::MalformedTag(_)));
    }

    #[test]
    fn test_truncated_content() {
        let err = parse(&[0x0C, 0x01, 0x02]).unwrap_err();
        assert!(matches!(err, EncodingError::MalformedTag(_)));
    }

    #[test]
    fn test_application_boolean_round_trip() {
        let bytes = vec![0x11, 0x10, 0x21, 0x05];
        let list = parse(&bytes).unwrap();
        assert_eq!(list.as_slice()[0], Tag::application(ApplicationTag::Boolean, vec![1]));
        assert_eq!(list.as_slice()[1], Tag::application(ApplicationTag::Boolean, vec![0]));
        assert_eq!(serialize(&list).unwrap(), bytes);
    }

    #[test]
    fn test_serialize_rejects_ill_nested_list() {
        let list = TagList::from(vec![Tag::Opening { context: 2 }, Tag::Closing { context: 3 }]);
        assert!(matches!(serialize(&list), Err(EncodingError::MalformedTag(_))));
    }

    #[test]
    fn test_cursor_take_group_skips_inner_groups() {
        // ctx0 01, Open(3) Open(3) ctx3 02 Close(3) Close(3), ctx4 03
        let bytes = [0x09, 0x01, 0x3E, 0x3E, 0x39, 0x02, 0x3F, 0x3F, 0x49, 0x03];
        let list = parse(&bytes).unwrap();
        let mut cursor = list.cursor();
        assert_eq!(cursor.expect_context(0).unwrap(), &[0x01]);
        let inner = cursor.take_group(3).unwrap();
        assert_eq!(inner.len(), 3);
        assert_eq!(cursor.peek_class(), Some(TagClass::Context));
        assert_eq!(cursor.peek_context(), Some(4));
        assert_eq!(cursor.optional_context(5), None);
        assert_eq!(cursor.expect_context(4).unwrap(), &[0x03]);
        assert!(cursor.is_empty());
    }

    fn leaf() -> impl Strategy<Value = Vec<Tag>> {
        prop_oneof![
            (0u8..40, proptest::collection::vec(any::<u8>(), 0..300))
                .prop_map(|(context, data)| vec![Tag::context(context, data)]),
            (
                prop::sample::select(vec![0u8, 2, 3, 4, 6, 7, 9, 12]),
                proptest::collection::vec(any::<u8>(), 0..20)
            )
                .prop_map(|(tag, data)| vec![Tag::Application {
                    tag,
                    data: data.into()
                }]),
            (0u8..2).prop_map(|v| vec![Tag::application(ApplicationTag::Boolean, vec![v])]),
        ]
    }

    fn well_formed() -> impl Strategy<Value = Vec<Tag>> {
        leaf().prop_recursive(4, 64, 6, |inner| {
            (0u8..20, proptest::collection::vec(inner, 0..6)).prop_map(|(context, children)| {
                let mut tags = vec![Tag::Opening { context }];
                tags.extend(children.into_iter().flatten());
                tags.push(Tag::Closing { context });
                tags
            })
        })
    }

    proptest! {
        #[test]
        fn prop_parse_serialize_round_trip(groups in proptest::collection::vec(well_formed(), 0..5)) {
            let list: TagList = groups.into_iter().flatten().collect();
            let bytes = serialize(&list).unwrap();
            let parsed = parse(&bytes).unwrap();
            prop_assert_eq!(&parsed, &list);
            prop_assert_eq!(serialize(&parsed).unwrap(), bytes);
        }
    }
}
