// OPCUA for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! Contains the implementation of `NodeId`.

use std::{fmt, str::FromStr};

/// The kind of identifier, numeric or string
#[derive(Eq, PartialEq, Clone, Debug, Hash, Serialize, Deserialize)]
pub enum Identifier {
    Numeric(u32),
    String(String),
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Identifier::Numeric(v) => write!(f, "i={}", *v),
            Identifier::String(v) => write!(f, "s={}", v),
        }
    }
}

impl FromStr for Identifier {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() < 2 {
            Err(())
        } else {
            let k = &s[..2];
            let v = &s[2..];
            match k {
                "i=" => v.parse::<u32>().map(|v| v.into()).map_err(|_| ()),
                "s=" => Ok(Identifier::String(v.to_string())),
                _ => Err(()),
            }
        }
    }
}

impl From<u32> for Identifier {
    fn from(v: u32) -> Self {
        Identifier::Numeric(v)
    }
}

impl From<String> for Identifier {
    fn from(v: String) -> Self {
        Identifier::String(v)
    }
}

impl<'a> From<&'a str> for Identifier {
    fn from(v: &'a str) -> Self {
        Identifier::String(v.to_string())
    }
}

/// An identifier for a node in the address space of an OPC UA Server.
#[derive(PartialEq, Eq, Clone, Debug, Hash, Serialize, Deserialize)]
pub struct NodeId {
    /// The index for a namespace
    pub namespace: u16,
    /// The identifier for the node in the address space
    pub identifier: Identifier,
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.namespace != 0 {
            write!(f, "ns={};{}", self.namespace, self.identifier)
        } else {
            write!(f, "{}", self.identifier)
        }
    }
}

impl FromStr for NodeId {
    type Err = ();

    /// Parses `ns=<n>;i=<v>`, `ns=<n>;s=<v>` or the same without the namespace prefix.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (namespace, identifier) = match s.strip_prefix("ns=") {
            Some(rest) => {
                let (ns, id) = rest.split_once(';').ok_or(())?;
                (ns.parse::<u16>().map_err(|_| ())?, id)
            }
            None => (0, s),
        };
        Ok(NodeId {
            namespace,
            identifier: Identifier::from_str(identifier)?,
        })
    }
}

impl Default for NodeId {
    fn default() -> Self {
        NodeId::null()
    }
}

impl<'a> From<(u16, &'a str)> for NodeId {
    fn from(v: (u16, &'a str)) -> Self {
        Self::new(v.0, v.1.to_string())
    }
}

impl From<(u16, u32)> for NodeId {
    fn from(v: (u16, u32)) -> Self {
        Self::new(v.0, v.1)
    }
}

impl NodeId {
    /// Constructs a new NodeId from anything that can be turned into Identifier
    pub fn new<T>(namespace: u16, value: T) -> NodeId
    where
        T: 'static + Into<Identifier>,
    {
        NodeId {
            namespace,
            identifier: value.into(),
        }
    }

    /// Returns a null node id
    pub fn null() -> NodeId {
        NodeId::new(0, 0u32)
    }

    /// Test if the node id is null, i.e. 0 namespace and 0 identifier
    pub fn is_null(&self) -> bool {
        self.namespace == 0 && self.identifier == Identifier::Numeric(0)
    }

    /// Returns the numeric identifier when the node id is numeric
    pub fn as_u32(&self) -> Option<u32> {
        match self.identifier {
            Identifier::Numeric(id) => Some(id),
            _ => None,
        }
    }
}

#[test]
fn node_id_parse() {
    assert_eq!(NodeId::from_str("i=2258").unwrap(), NodeId::new(0, 2258u32));
    assert_eq!(
        NodeId::from_str("ns=2;s=Demo.Temperature").unwrap(),
        NodeId::new(2, "Demo.Temperature")
    );
    assert!(NodeId::from_str("ns=x;i=1").is_err());
    assert_eq!(NodeId::new(2, 7u32).to_string(), "ns=2;i=7");
    assert!(NodeId::null().is_null());
}

#[test]
fn node_id_from_borrowed_str() {
    let name = format!("Pump{}", 1);
    let node_id = NodeId::from((2, name.as_str()));
    drop(name);
    assert_eq!(node_id, NodeId::new(2, "Pump1"));
}
