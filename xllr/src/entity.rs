//! Entity paths: `key=value` tokens separated by commas naming one callable,
//! field or attribute inside a loaded module.
//!
//! ```text
//! class=guest.CoreFunctions,callable=divIntegers
//! class=guest.SomeClass,callable=<init>
//! class=guest.SomeClass,field=name,getter,instance_required
//! callable=SomeClass.GetName,instance_required
//! attribute=CONSTANT,getter
//! ```

use std::fmt;
use std::str::FromStr;

use crate::XllrError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PathKey {
    Class,
    Callable,
    Field,
    Attribute,
    Module,
    Package,
    Getter,
    Setter,
    InstanceRequired,
}

impl PathKey {
    pub fn from_name(name: &str) -> Option<Self> {
        let key = match name {
            "class" => Self::Class,
            "callable" => Self::Callable,
            "field" => Self::Field,
            "attribute" => Self::Attribute,
            "module" => Self::Module,
            "package" => Self::Package,
            "getter" => Self::Getter,
            "setter" => Self::Setter,
            "instance_required" => Self::InstanceRequired,
            _ => return None,
        };
        Some(key)
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Class => "class",
            Self::Callable => "callable",
            Self::Field => "field",
            Self::Attribute => "attribute",
            Self::Module => "module",
            Self::Package => "package",
            Self::Getter => "getter",
            Self::Setter => "setter",
            Self::InstanceRequired => "instance_required",
        }
    }

    /// Flags are written bare; every other key needs a value.
    pub const fn is_flag(self) -> bool {
        matches!(self, Self::Getter | Self::Setter | Self::InstanceRequired)
    }
}

impl fmt::Display for PathKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Member {
    Callable(String),
    Field(String),
    Attribute(String),
}

impl Member {
    pub fn name(&self) -> &str {
        match self {
            Self::Callable(name) | Self::Field(name) | Self::Attribute(name) => name,
        }
    }

    /// Constructor callables are spelled `<init>`.
    pub fn is_constructor(&self) -> bool {
        matches!(self, Self::Callable(name) if name == "<init>")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Accessor {
    Getter,
    Setter,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityPath {
    raw: String,
    pairs: Vec<(PathKey, Option<String>)>,
    class: Option<String>,
    module: Option<String>,
    package: Option<String>,
    member: Member,
    accessor: Option<Accessor>,
    instance_required: bool,
}

impl EntityPath {
    pub fn parse(raw: &str) -> Result<Self, XllrError> {
        let invalid = |reason: String| XllrError::InvalidEntityPath {
            path: raw.to_string(),
            reason,
        };

        if raw.trim().is_empty() {
            return Err(invalid("empty path".into()));
        }

        let mut pairs: Vec<(PathKey, Option<String>)> = Vec::new();
        for token in raw.split(',') {
            let token = token.trim();
            if token.is_empty() {
                return Err(invalid("empty token".into()));
            }
            let (name, value) = match token.split_once('=') {
                Some((name, value)) => (name.trim(), Some(value.trim())),
                None => (token, None),
            };
            let key = PathKey::from_name(name)
                .ok_or_else(|| invalid(format!("unrecognized key `{name}`")))?;
            if pairs.iter().any(|(seen, _)| *seen == key) {
                return Err(invalid(format!("duplicate key `{key}`")));
            }
            let value = match (key.is_flag(), value) {
                (true, None) => None,
                (true, Some(_)) => return Err(invalid(format!("`{key}` takes no value"))),
                (false, None) => return Err(invalid(format!("`{key}` needs a value"))),
                (false, Some("")) => return Err(invalid(format!("empty value for `{key}`"))),
                (false, Some(value)) => Some(value.to_string()),
            };
            pairs.push((key, value));
        }

        let value_of = |key: PathKey| {
            pairs
                .iter()
                .find(|(k, _)| *k == key)
                .and_then(|(_, value)| value.clone())
        };
        let has = |key: PathKey| pairs.iter().any(|(k, _)| *k == key);

        let mut members = [
            value_of(PathKey::Callable).map(Member::Callable),
            value_of(PathKey::Field).map(Member::Field),
            value_of(PathKey::Attribute).map(Member::Attribute),
        ]
        .into_iter()
        .flatten();
        let member = members.next().ok_or_else(|| {
            invalid("one of `callable`, `field` or `attribute` is required".into())
        })?;
        if members.next().is_some() {
            return Err(invalid(
                "only one of `callable`, `field` or `attribute` may be given".into(),
            ));
        }

        let accessor = match (has(PathKey::Getter), has(PathKey::Setter)) {
            (true, true) => return Err(invalid("`getter` and `setter` are exclusive".into())),
            (true, false) => Some(Accessor::Getter),
            (false, true) => Some(Accessor::Setter),
            (false, false) => None,
        };
        match (&member, accessor) {
            (Member::Field(_) | Member::Attribute(_), None) => {
                return Err(invalid(format!(
                    "`{}` needs `getter` or `setter`",
                    member.name()
                )));
            }
            (Member::Callable(_), Some(_)) => {
                return Err(invalid(
                    "`getter`/`setter` apply to fields and attributes only".into(),
                ));
            }
            _ => {}
        }

        Ok(Self {
            raw: raw.to_string(),
            class: value_of(PathKey::Class),
            module: value_of(PathKey::Module),
            package: value_of(PathKey::Package),
            instance_required: has(PathKey::InstanceRequired),
            pairs,
            member,
            accessor,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Tokens in written order.
    pub fn pairs(&self) -> impl Iterator<Item = (PathKey, Option<&str>)> {
        self.pairs.iter().map(|(key, value)| (*key, value.as_deref()))
    }

    pub fn class(&self) -> Option<&str> {
        self.class.as_deref()
    }

    pub fn module(&self) -> Option<&str> {
        self.module.as_deref()
    }

    pub fn package(&self) -> Option<&str> {
        self.package.as_deref()
    }

    pub fn member(&self) -> &Member {
        &self.member
    }

    pub fn accessor(&self) -> Option<Accessor> {
        self.accessor
    }

    pub fn instance_required(&self) -> bool {
        self.instance_required
    }

    pub fn is_constructor(&self) -> bool {
        self.member.is_constructor()
    }

    /// Splits a dotted member (`SomeClass.GetName`) at its last dot into
    /// owner and name. Undotted members have no owner.
    pub fn split_member(&self) -> (Option<&str>, &str) {
        let name = self.member.name();
        match name.rsplit_once('.') {
            Some((owner, member)) if !owner.is_empty() && !member.is_empty() => {
                (Some(owner), member)
            }
            _ => (None, name),
        }
    }

    /// The class an entity belongs to: `class=`, or the owner of a dotted
    /// member.
    pub fn owner(&self) -> Option<&str> {
        self.class().or_else(|| self.split_member().0)
    }

    /// The member name with any dotted owner removed.
    pub fn member_name(&self) -> &str {
        if self.class.is_some() {
            return self.member.name();
        }
        self.split_member().1
    }
}

impl FromStr for EntityPath {
    type Err = XllrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for EntityPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
