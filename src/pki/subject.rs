//! Certificate subject handling
//!
//! The connector hands out the subject the agent must request as a flat
//! string such as `CN=ec-default,O=Organization,OU=OrgUnit,L=Waldorf,ST=Waldorf,C=DE`.

use rcgen::{DistinguishedName, DnType};
use serde::{Deserialize, Serialize};
use x509_parser::x509::{AttributeTypeAndValue, X509Name};

/// Distinguished name fields the connector issues certificates for
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    /// CN
    pub common_name: String,
    /// O
    pub organization: String,
    /// OU
    pub organizational_unit: String,
    /// L
    pub locality: String,
    /// ST
    pub province: String,
    /// C
    pub country: String,
}

impl Subject {
    /// Parse a comma separated `KEY=value` subject string
    ///
    /// Parsing is permissive: unknown keys and parts without `=` are
    /// ignored, missing fields stay empty, whitespace around keys and values
    /// is trimmed. Values cannot contain `,` or `=`; anything after a second
    /// `=` in a part is dropped.
    pub fn parse(raw: &str) -> Self {
        let mut subject = Subject::default();

        for part in raw.split(',') {
            let mut kv = part.split('=');
            let (Some(key), Some(value)) = (kv.next(), kv.next()) else {
                continue;
            };
            let value = value.trim().to_string();

            match key.trim() {
                "CN" => subject.common_name = value,
                "O" => subject.organization = value,
                "OU" => subject.organizational_unit = value,
                "L" => subject.locality = value,
                "ST" => subject.province = value,
                "C" => subject.country = value,
                _ => {}
            }
        }

        subject
    }

    /// Read the subject of an issued certificate
    pub fn from_x509_name(name: &X509Name<'_>) -> Self {
        fn first<'a, 'b: 'a>(
            mut values: impl Iterator<Item = &'a AttributeTypeAndValue<'b>>,
        ) -> String {
            values
                .next()
                .and_then(|v| v.as_str().ok())
                .unwrap_or_default()
                .to_string()
        }

        Self {
            common_name: first(name.iter_common_name()),
            organization: first(name.iter_organization()),
            organizational_unit: first(name.iter_organizational_unit()),
            locality: first(name.iter_locality()),
            province: first(name.iter_state_or_province()),
            country: first(name.iter_country()),
        }
    }

    /// Distinguished name for a CSR, in C, ST, L, O, OU, CN order
    ///
    /// Empty fields are left out.
    pub fn to_distinguished_name(&self) -> DistinguishedName {
        let mut dn = DistinguishedName::new();
        let fields = [
            (DnType::CountryName, &self.country),
            (DnType::StateOrProvinceName, &self.province),
            (DnType::LocalityName, &self.locality),
            (DnType::OrganizationName, &self.organization),
            (DnType::OrganizationalUnitName, &self.organizational_unit),
            (DnType::CommonName, &self.common_name),
        ];
        for (ty, value) in fields {
            if !value.is_empty() {
                dn.push(ty, value.as_str());
            }
        }
        dn
    }
}

impl std::fmt::Display for Subject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "CN={},O={},OU={},L={},ST={},C={}",
            self.common_name,
            self.organization,
            self.organizational_unit,
            self.locality,
            self.province,
            self.country
        )
    }
}
