//! HPROF basic type tags

use serde::{Deserialize, Serialize};

/// Basic type of a field, static value or array element
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum FieldType {
    Object = 2,
    Boolean = 4,
    Char = 5,
    Float = 6,
    Double = 7,
    Byte = 8,
    Short = 9,
    Int = 10,
    Long = 11,
}

impl FieldType {
    /// All primitive types in tag order
    pub const PRIMITIVES: [FieldType; 8] = [
        FieldType::Boolean,
        FieldType::Char,
        FieldType::Float,
        FieldType::Double,
        FieldType::Byte,
        FieldType::Short,
        FieldType::Int,
        FieldType::Long,
    ];

    pub fn from_tag(tag: u8) -> Option<FieldType> {
        match tag {
            2 => Some(FieldType::Object),
            4 => Some(FieldType::Boolean),
            5 => Some(FieldType::Char),
            6 => Some(FieldType::Float),
            7 => Some(FieldType::Double),
            8 => Some(FieldType::Byte),
            9 => Some(FieldType::Short),
            10 => Some(FieldType::Int),
            11 => Some(FieldType::Long),
            _ => None,
        }
    }

    /// Primitive array element type; object and unknown tags are rejected
    pub fn primitive_from_tag(tag: u8) -> Option<FieldType> {
        match Self::from_tag(tag)? {
            FieldType::Object => None,
            t => Some(t),
        }
    }

    #[inline]
    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn is_object(self) -> bool {
        self == FieldType::Object
    }

    /// Size in bytes of a primitive value. References are `id_size` wide in the dump.
    #[inline]
    pub fn size(self, id_size: usize) -> usize {
        match self {
            FieldType::Object => id_size,
            FieldType::Boolean | FieldType::Byte => 1,
            FieldType::Char | FieldType::Short => 2,
            FieldType::Float | FieldType::Int => 4,
            FieldType::Double | FieldType::Long => 8,
        }
    }

    /// Class name of a one-dimensional primitive array of this type
    pub fn array_class_name(self) -> &'static str {
        match self {
            FieldType::Object => "java.lang.Object[]",
            FieldType::Boolean => "boolean[]",
            FieldType::Char => "char[]",
            FieldType::Float => "float[]",
            FieldType::Double => "double[]",
            FieldType::Byte => "byte[]",
            FieldType::Short => "short[]",
            FieldType::Int => "int[]",
            FieldType::Long => "long[]",
        }
    }

    /// JVM signature character
    pub fn signature(self) -> char {
        match self {
            FieldType::Object => 'L',
            FieldType::Boolean => 'Z',
            FieldType::Char => 'C',
            FieldType::Float => 'F',
            FieldType::Double => 'D',
            FieldType::Byte => 'B',
            FieldType::Short => 'S',
            FieldType::Int => 'I',
            FieldType::Long => 'J',
        }
    }

    pub fn from_signature(c: char) -> Option<FieldType> {
        Self::PRIMITIVES.into_iter().find(|t| t.signature() == c)
    }

    /// Display name used for field descriptors
    pub fn name(self) -> &'static str {
        match self {
            FieldType::Object => "object",
            FieldType::Boolean => "boolean",
            FieldType::Char => "char",
            FieldType::Float => "float",
            FieldType::Double => "double",
            FieldType::Byte => "byte",
            FieldType::Short => "short",
            FieldType::Int => "int",
            FieldType::Long => "long",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primitive_range() {
        assert_eq!(FieldType::primitive_from_tag(4), Some(FieldType::Boolean));
        assert_eq!(FieldType::primitive_from_tag(11), Some(FieldType::Long));
        assert_eq!(FieldType::primitive_from_tag(2), None);
        assert_eq!(FieldType::primitive_from_tag(3), None);
        assert_eq!(FieldType::primitive_from_tag(12), None);
    }

    #[test]
    fn test_element_sizes() {
        let sizes: Vec<usize> = FieldType::PRIMITIVES.iter().map(|t| t.size(8)).collect();
        assert_eq!(sizes, vec![1, 2, 4, 8, 1, 2, 4, 8]);
        assert_eq!(FieldType::Object.size(4), 4);
    }

    #[test]
    fn test_signatures() {
        assert_eq!(FieldType::from_signature('J'), Some(FieldType::Long));
        assert_eq!(FieldType::from_signature('L'), None);
    }
}
