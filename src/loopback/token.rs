use crate::{
    error::{MajorStatus, ProviderError},
    oid::Oid,
    settings::ContextFlags,
};

const MAGIC: &[u8; 4] = b"LBK1";
const KIND_INIT: u8 = 1;
const KIND_REPLY: u8 = 2;
const KIND_FINAL: u8 = 3;

#[derive(Debug, PartialEq, Eq)]
pub(super) struct Init {
    pub round: u32,
    pub flags: ContextFlags,
    pub initiator: String,
    pub target: String,
    pub bindings: Vec<u8>,
}

#[derive(Debug, PartialEq, Eq)]
pub(super) enum Token {
    Init(Init),
    Reply { round: u32 },
    Final,
}
impl Token {
    pub fn encode(&self) -> Result<Vec<u8>, ProviderError> {
        let mut out = MAGIC.to_vec();
        match self {
            Self::Init(init) => {
                out.push(KIND_INIT);
                out.extend_from_slice(&init.round.to_be_bytes());
                out.extend_from_slice(&init.flags.bits().to_be_bytes());
                put_short(&mut out, init.initiator.as_bytes())?;
                put_short(&mut out, init.target.as_bytes())?;
                put_long(&mut out, &init.bindings)?;
            }
            Self::Reply { round } => {
                out.push(KIND_REPLY);
                out.extend_from_slice(&round.to_be_bytes());
            }
            Self::Final => out.push(KIND_FINAL),
        }
        Ok(out)
    }
    pub fn decode(data: &[u8]) -> Result<Self, ProviderError> {
        let mut reader = Reader::new(data);
        if reader.take(MAGIC.len())? != MAGIC {
            return Err(defective("not a loopback token"));
        }
        let token = match reader.u8()? {
            KIND_INIT => Self::Init(Init {
                round: reader.u32()?,
                flags: ContextFlags::from_bits_truncate(reader.u32()?),
                initiator: reader.short_text()?,
                target: reader.short_text()?,
                bindings: reader.long_bytes()?.to_vec(),
            }),
            KIND_REPLY => Self::Reply { round: reader.u32()? },
            KIND_FINAL => Self::Final,
            _ => return Err(defective("unknown token kind")),
        };
        reader.finish()?;
        Ok(token)
    }
}

/// RFC 2743 section 3.2 exported name.
pub(super) fn export_name(mechanism: &Oid, name: &str) -> Result<Vec<u8>, ProviderError> {
    let oid = mechanism.as_bytes();
    let oid_len =
        u8::try_from(oid.len()).map_err(|_| ProviderError::new(MajorStatus::BAD_MECH, 0, "mechanism too long"))?;
    let mut out = vec![0x04, 0x01];
    out.extend_from_slice(&(u16::from(oid_len) + 2).to_be_bytes());
    out.push(0x06);
    out.push(oid_len);
    out.extend_from_slice(oid);
    put_long(&mut out, name.as_bytes())?;
    Ok(out)
}

pub(super) fn import_exported_name(data: &[u8]) -> Result<(Oid, String), ProviderError> {
    let bad_name = |_| ProviderError::new(MajorStatus::BAD_NAME, 0, "malformed exported name");
    let mut reader = Reader::new(data);
    if reader.take(2).map_err(bad_name)? != [0x04, 0x01] {
        return Err(ProviderError::new(MajorStatus::BAD_NAME, 0, "not an exported name"));
    }
    let der_len = usize::from(reader.u16().map_err(bad_name)?);
    let der = reader.take(der_len).map_err(bad_name)?;
    let [0x06, len, body @ ..] = der else {
        return Err(ProviderError::new(MajorStatus::BAD_NAME, 0, "exported name lacks an object identifier"));
    };
    if usize::from(*len) != body.len() {
        return Err(ProviderError::new(MajorStatus::BAD_NAME, 0, "exported name has a bad identifier length"));
    }
    let name = reader.long_text().map_err(bad_name)?;
    reader.finish().map_err(bad_name)?;
    Ok((Oid::from_bytes(body), name))
}

fn put_short(out: &mut Vec<u8>, data: &[u8]) -> Result<(), ProviderError> {
    let len = u16::try_from(data.len()).map_err(|_| ProviderError::failure("field too long"))?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(data);
    Ok(())
}

fn put_long(out: &mut Vec<u8>, data: &[u8]) -> Result<(), ProviderError> {
    let len = u32::try_from(data.len()).map_err(|_| ProviderError::failure("field too long"))?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(data);
    Ok(())
}

fn defective(message: &str) -> ProviderError {
    ProviderError::new(MajorStatus::DEFECTIVE_TOKEN, 0, message)
}

pub(super) struct Reader<'a> {
    data: &'a [u8],
}
impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }
    pub fn take(&mut self, len: usize) -> Result<&'a [u8], ProviderError> {
        if self.data.len() < len {
            return Err(defective("token truncated"));
        }
        let (head, tail) = self.data.split_at(len);
        self.data = tail;
        Ok(head)
    }
    pub fn u8(&mut self) -> Result<u8, ProviderError> {
        Ok(self.take(1)?[0])
    }
    pub fn u16(&mut self) -> Result<u16, ProviderError> {
        let mut bytes = [0; 2];
        bytes.copy_from_slice(self.take(2)?);
        Ok(u16::from_be_bytes(bytes))
    }
    pub fn u32(&mut self) -> Result<u32, ProviderError> {
        let mut bytes = [0; 4];
        bytes.copy_from_slice(self.take(4)?);
        Ok(u32::from_be_bytes(bytes))
    }
    pub fn u64(&mut self) -> Result<u64, ProviderError> {
        let mut bytes = [0; 8];
        bytes.copy_from_slice(self.take(8)?);
        Ok(u64::from_be_bytes(bytes))
    }
    fn short_text(&mut self) -> Result<String, ProviderError> {
        let len = usize::from(self.u16()?);
        text(self.take(len)?)
    }
    fn long_bytes(&mut self) -> Result<&'a [u8], ProviderError> {
        let len = usize::try_from(self.u32()?).map_err(|_| defective("field too long"))?;
        self.take(len)
    }
    fn long_text(&mut self) -> Result<String, ProviderError> {
        let bytes = self.long_bytes()?;
        text(bytes)
    }
    pub fn rest(&mut self) -> &'a [u8] {
        std::mem::take(&mut self.data)
    }
    pub fn finish(&self) -> Result<(), ProviderError> {
        if self.data.is_empty() {
            Ok(())
        } else {
            Err(defective("trailing bytes in token"))
        }
    }
}

fn text(bytes: &[u8]) -> Result<String, ProviderError> {
    String::from_utf8(bytes.to_vec()).map_err(|_| defective("name is not UTF-8"))
}

/// FNV-1a over the concatenation of `parts`.
pub(super) fn digest(parts: &[&[u8]]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for part in parts {
        for byte in *part {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
    }
    hash
}

/// XORs `data` with a keystream derived from `key`. Applying it twice restores the input.
/// This is obfuscation for tests, not encryption.
pub(super) fn apply_keystream(key: u64, data: &mut [u8]) {
    let mut state = key | 1;
    for byte in data {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        *byte ^= state.to_le_bytes()[0];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LOOPBACK_MECH;

    #[test]
    fn init_token_layout() {
        let token = Token::Init(Init {
            round: 2,
            flags: ContextFlags::MUTUAL_AUTH,
            initiator: "a".into(),
            target: "b".into(),
            bindings: Vec::new(),
        });
        let encoded = token.encode().unwrap();
        assert_eq!(&encoded[..5], b"LBK1\x01");
        assert_eq!(encoded.len(), 5 + 4 + 4 + 3 + 3 + 4);
        assert_eq!(Token::decode(&encoded).unwrap(), token);
    }

    #[test]
    fn truncated_and_trailing_tokens_are_defective() {
        let encoded = Token::Reply { round: 1 }.encode().unwrap();
        let err = Token::decode(&encoded[..encoded.len() - 1]).unwrap_err();
        assert_eq!(err.major, MajorStatus::DEFECTIVE_TOKEN);
        let mut longer = encoded.clone();
        longer.push(0);
        assert_eq!(Token::decode(&longer).unwrap_err().major, MajorStatus::DEFECTIVE_TOKEN);
        assert_eq!(Token::decode(b"").unwrap_err().major, MajorStatus::DEFECTIVE_TOKEN);
    }

    #[test]
    fn exported_names_follow_rfc_2743() {
        let exported = export_name(&LOOPBACK_MECH, "alice").unwrap();
        let mech = LOOPBACK_MECH;
        let oid = mech.as_bytes();
        assert_eq!(&exported[..2], b"\x04\x01");
        assert_eq!(usize::from(u16::from_be_bytes([exported[2], exported[3]])), oid.len() + 2);
        assert_eq!(exported[4], 0x06);
        assert_eq!(&exported[exported.len() - 9..], b"\0\0\0\x05alice");
        assert_eq!(import_exported_name(&exported).unwrap(), (LOOPBACK_MECH, "alice".to_owned()));
        assert_eq!(import_exported_name(b"\x04\x02").unwrap_err().major, MajorStatus::BAD_NAME);
    }

    #[test]
    fn keystream_is_an_involution() {
        let mut data = b"attack at dawn".to_vec();
        apply_keystream(42, &mut data);
        assert_ne!(data, b"attack at dawn");
        apply_keystream(42, &mut data);
        assert_eq!(data, b"attack at dawn");
    }
}
