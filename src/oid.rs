//! Object identifiers and ordered identifier sets.
//!
//! Identifiers are kept as the DER body bytes (no tag or length), which is what GSS-API
//! implementations pass around in `gss_OID_desc`.

use std::{borrow::Cow, fmt};

use thiserror::Error;

use crate::Error;

#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Oid(Cow<'static, [u8]>);

#[derive(Debug, Error)]
#[error("{0:?} is not a dotted object identifier")]
pub struct ParseOidError(String);

impl Oid {
    pub const fn from_static(der: &'static [u8]) -> Self {
        Self(Cow::Borrowed(der))
    }
    pub fn from_bytes(der: &[u8]) -> Self {
        Self(Cow::Owned(der.to_vec()))
    }
    /// Parses dotted decimal notation such as `1.2.840.113554.1.2.2`.
    pub fn from_dotted(text: &str) -> Result<Self, ParseOidError> {
        let invalid = || ParseOidError(text.to_owned());
        let arcs = text
            .split('.')
            .map(|arc| arc.parse::<u64>().map_err(|_| invalid()))
            .collect::<Result<Vec<_>, _>>()?;
        let [first, second, rest @ ..] = arcs.as_slice() else {
            return Err(invalid());
        };
        if *first > 2 || (*first < 2 && *second >= 40) {
            return Err(invalid());
        }
        let leading = first
            .checked_mul(40)
            .and_then(|v| v.checked_add(*second))
            .ok_or_else(invalid)?;
        let mut der = Vec::new();
        for arc in std::iter::once(leading).chain(rest.iter().copied()) {
            encode_arc(arc, &mut der);
        }
        Ok(Self(Cow::Owned(der)))
    }
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
    /// Decodes the arcs, or `None` if the body is not valid base-128.
    pub fn arcs(&self) -> Option<Vec<u64>> {
        let mut arcs = Vec::new();
        let mut value: u64 = 0;
        let mut pending = false;
        for &byte in self.as_bytes() {
            value = value.checked_mul(128)?.checked_add(u64::from(byte & 0x7f))?;
            pending = byte & 0x80 != 0;
            if !pending {
                if arcs.is_empty() {
                    let first = (value / 40).min(2);
                    arcs.push(first);
                    arcs.push(value - first * 40);
                } else {
                    arcs.push(value);
                }
                value = 0;
            }
        }
        if pending || arcs.is_empty() {
            return None;
        }
        Some(arcs)
    }
    /// The conventional name of a well-known identifier.
    pub fn well_known_name(&self) -> Option<&'static str> {
        WELL_KNOWN
            .iter()
            .find(|(_, oid)| oid == self)
            .map(|(name, _)| *name)
    }
}

fn encode_arc(arc: u64, out: &mut Vec<u8>) {
    let mut groups = [0u8; 10];
    let mut index = groups.len();
    let mut value = arc;
    loop {
        index -= 1;
        groups[index] = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            break;
        }
    }
    let last = groups.len() - 1;
    for (position, group) in groups.iter().enumerate().skip(index) {
        out.push(if position == last { *group } else { group | 0x80 });
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some(arcs) = self.arcs() else {
            return write!(f, "<invalid oid {:02x?}>", self.as_bytes());
        };
        for (i, arc) in arcs.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            write!(f, "{arc}")?;
        }
        Ok(())
    }
}
impl fmt::Debug for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.well_known_name() {
            Some(name) => f.write_str(name),
            None => write!(f, "Oid({self})"),
        }
    }
}
impl AsRef<[u8]> for Oid {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

pub const GSS_C_NT_USER_NAME: Oid = Oid::from_static(b"\x2a\x86\x48\x86\xf7\x12\x01\x02\x01\x01");
pub const GSS_C_NT_MACHINE_UID_NAME: Oid = Oid::from_static(b"\x2a\x86\x48\x86\xf7\x12\x01\x02\x01\x02");
pub const GSS_C_NT_STRING_UID_NAME: Oid = Oid::from_static(b"\x2a\x86\x48\x86\xf7\x12\x01\x02\x01\x03");
pub const GSS_C_NT_HOSTBASED_SERVICE_X: Oid = Oid::from_static(b"\x2b\x06\x01\x05\x06\x02");
pub const GSS_C_NT_HOSTBASED_SERVICE: Oid = Oid::from_static(b"\x2a\x86\x48\x86\xf7\x12\x01\x02\x01\x04");
pub const GSS_C_NT_ANONYMOUS: Oid = Oid::from_static(b"\x2b\x06\x01\x05\x06\x03");
pub const GSS_C_NT_EXPORT_NAME: Oid = Oid::from_static(b"\x2b\x06\x01\x05\x06\x04");
pub const GSS_KRB5_NT_PRINCIPAL_NAME: Oid = Oid::from_static(b"\x2a\x86\x48\x86\xf7\x12\x01\x02\x02\x01");
pub const GSS_KRB5_NT_PRINCIPAL: Oid = Oid::from_static(b"\x2a\x86\x48\x86\xf7\x12\x01\x02\x02\x02");
pub const GSS_MECH_KRB5: Oid = Oid::from_static(b"\x2a\x86\x48\x86\xf7\x12\x01\x02\x02");
pub const GSS_MECH_KRB5_LEGACY: Oid = Oid::from_static(b"\x2a\x86\x48\x82\xf7\x12\x01\x02\x02");
pub const GSS_MECH_KRB5_OLD: Oid = Oid::from_static(b"\x2b\x05\x01\x05\x02");
pub const GSS_MECH_SPNEGO: Oid = Oid::from_static(b"\x2b\x06\x01\x05\x05\x02");
pub const GSS_MECH_IAKERB: Oid = Oid::from_static(b"\x2b\x06\x01\x05\x02\x05");
pub const GSS_MECH_NTLMSSP: Oid = Oid::from_static(b"\x2b\x06\x01\x04\x01\x82\x37\x02\x02\x0a");

static WELL_KNOWN: [(&str, Oid); 15] = [
    ("GSS_C_NT_USER_NAME", GSS_C_NT_USER_NAME),
    ("GSS_C_NT_MACHINE_UID_NAME", GSS_C_NT_MACHINE_UID_NAME),
    ("GSS_C_NT_STRING_UID_NAME", GSS_C_NT_STRING_UID_NAME),
    ("GSS_C_NT_HOSTBASED_SERVICE_X", GSS_C_NT_HOSTBASED_SERVICE_X),
    ("GSS_C_NT_HOSTBASED_SERVICE", GSS_C_NT_HOSTBASED_SERVICE),
    ("GSS_C_NT_ANONYMOUS", GSS_C_NT_ANONYMOUS),
    ("GSS_C_NT_EXPORT_NAME", GSS_C_NT_EXPORT_NAME),
    ("GSS_KRB5_NT_PRINCIPAL_NAME", GSS_KRB5_NT_PRINCIPAL_NAME),
    ("GSS_KRB5_NT_PRINCIPAL", GSS_KRB5_NT_PRINCIPAL),
    ("GSS_MECH_KRB5", GSS_MECH_KRB5),
    ("GSS_MECH_KRB5_LEGACY", GSS_MECH_KRB5_LEGACY),
    ("GSS_MECH_KRB5_OLD", GSS_MECH_KRB5_OLD),
    ("GSS_MECH_SPNEGO", GSS_MECH_SPNEGO),
    ("GSS_MECH_IAKERB", GSS_MECH_IAKERB),
    ("GSS_MECH_NTLMSSP", GSS_MECH_NTLMSSP),
];

/// An ordered set of identifiers. Adding a member that is already present does nothing.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct OidSet(Vec<Oid>);
impl OidSet {
    pub fn empty() -> Self {
        Self(Vec::new())
    }
    /// Appends `oid` unless it is already a member. Returns whether it was added.
    pub fn add(&mut self, oid: Oid) -> bool {
        if self.contains(&oid) {
            return false;
        }
        self.0.push(oid);
        true
    }
    pub fn contains(&self, oid: &Oid) -> bool {
        self.0.iter().any(|member| member == oid)
    }
    pub fn len(&self) -> usize {
        self.0.len()
    }
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
    pub fn get(&self, index: usize) -> Result<&Oid, Error> {
        self.0.get(index).ok_or(Error::Index {
            index,
            len: self.0.len(),
        })
    }
    pub fn iter(&self) -> std::slice::Iter<'_, Oid> {
        self.0.iter()
    }
}
impl Extend<Oid> for OidSet {
    fn extend<T: IntoIterator<Item = Oid>>(&mut self, iter: T) {
        for oid in iter {
            self.add(oid);
        }
    }
}
impl FromIterator<Oid> for OidSet {
    fn from_iter<T: IntoIterator<Item = Oid>>(iter: T) -> Self {
        let mut set = Self::empty();
        set.extend(iter);
        set
    }
}
impl<'a> IntoIterator for &'a OidSet {
    type Item = &'a Oid;
    type IntoIter = std::slice::Iter<'a, Oid>;
    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
impl fmt::Display for OidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, oid) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{oid:?}")?;
        }
        f.write_str("]")
    }
}
impl fmt::Debug for OidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn well_known_identifiers_print_dotted() {
        assert_eq!(GSS_MECH_KRB5.to_string(), "1.2.840.113554.1.2.2");
        assert_eq!(GSS_MECH_SPNEGO.to_string(), "1.3.6.1.5.5.2");
        assert_eq!(GSS_C_NT_HOSTBASED_SERVICE.to_string(), "1.2.840.113554.1.2.1.4");
        assert_eq!(GSS_MECH_NTLMSSP.to_string(), "1.3.6.1.4.1.311.2.2.10");
        assert_eq!(GSS_MECH_KRB5_LEGACY.to_string(), "1.2.840.48018.1.2.2");
    }

    #[test]
    fn dotted_notation_encodes_to_der_body() {
        assert_eq!(Oid::from_dotted("1.2.840.113554.1.2.2").unwrap(), GSS_MECH_KRB5);
        assert_eq!(Oid::from_dotted("1.3.6.1.5.6.4").unwrap(), GSS_C_NT_EXPORT_NAME);
        assert_eq!(Oid::from_dotted("2.999.3").unwrap().to_string(), "2.999.3");
        assert!(Oid::from_dotted("1").is_err());
        assert!(Oid::from_dotted("1.40").is_err());
        assert!(Oid::from_dotted("3.1").is_err());
        assert!(Oid::from_dotted("1.2.x").is_err());
    }

    #[test]
    fn registry_knows_names() {
        assert_eq!(GSS_MECH_SPNEGO.well_known_name(), Some("GSS_MECH_SPNEGO"));
        assert_eq!(Oid::from_bytes(b"\x2b\x06\x01\x05\x05\x02"), GSS_MECH_SPNEGO);
        assert_eq!(Oid::from_dotted("1.2.3").unwrap().well_known_name(), None);
        assert_eq!(format!("{GSS_MECH_KRB5:?}"), "GSS_MECH_KRB5");
    }

    #[test]
    fn truncated_body_does_not_decode() {
        let oid = Oid::from_bytes(b"\x2a\x86");
        assert_eq!(oid.arcs(), None);
        assert!(oid.to_string().starts_with("<invalid oid"));
    }

    #[test]
    fn set_add_is_idempotent() {
        let mut set = OidSet::empty();
        assert!(set.add(GSS_MECH_KRB5));
        assert!(!set.add(GSS_MECH_KRB5));
        set.extend([GSS_MECH_SPNEGO, GSS_MECH_KRB5]);
        assert_eq!(set.len(), 2);
        assert!(set.contains(&GSS_MECH_SPNEGO));
        assert!(!set.contains(&GSS_MECH_NTLMSSP));
        assert_eq!(set.to_string(), "[GSS_MECH_KRB5, GSS_MECH_SPNEGO]");
    }

    #[test]
    fn set_get_checks_bounds() {
        let set: OidSet = [GSS_MECH_KRB5, GSS_MECH_IAKERB].into_iter().collect();
        assert_eq!(set.get(1).unwrap(), &GSS_MECH_IAKERB);
        assert!(matches!(set.get(2), Err(Error::Index { index: 2, len: 2 })));
        assert!(matches!(OidSet::empty().get(0), Err(Error::Index { index: 0, len: 0 })));
    }
}
