//! Recognized entity collections.
//!
//! The entity schemas themselves live with the backend; the sync layer only
//! needs to know *which* collections a snapshot must always carry.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

macro_rules! collections {
    ($($variant:ident => $name:literal),+ $(,)?) => {
        /// Name of an entity collection carried by every [`Snapshot`](crate::Snapshot).
        #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(rename_all = "camelCase")]
        pub enum Collection {
            $($variant,)+
        }

        impl Collection {
            /// Every recognized collection, in declaration order.
            pub const ALL: &'static [Collection] = &[$(Collection::$variant,)+];

            /// Wire name used by the backend snapshot payload.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Collection::$variant => $name,)+
                }
            }
        }

        impl FromStr for Collection {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($name => Ok(Collection::$variant),)+
                    other => Err(format!("unrecognized collection: {other}")),
                }
            }
        }
    };
}

collections! {
    Orders => "orders",
    Products => "products",
    Projects => "projects",
    Quotes => "quotes",
    QuoteRequests => "quoteRequests",
    Bids => "bids",
    Tenders => "tenders",
    Contracts => "contracts",
    Invoices => "invoices",
    Payments => "payments",
    Suppliers => "suppliers",
    Contractors => "contractors",
    Materials => "materials",
    Inventory => "inventory",
    Warehouses => "warehouses",
    Deliveries => "deliveries",
    Shipments => "shipments",
    Vehicles => "vehicles",
    Drivers => "drivers",
    Routes => "routes",
    Reviews => "reviews",
    Disputes => "disputes",
    Messages => "messages",
    Notifications => "notifications",
}

impl core::fmt::Display for Collection {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_wire_name_parses_back() {
        for c in Collection::ALL {
            assert_eq!(c.as_str().parse::<Collection>().unwrap(), *c);
        }
    }

    #[test]
    fn serde_uses_wire_names() {
        let json = serde_json::to_string(&Collection::QuoteRequests).unwrap();
        assert_eq!(json, "\"quoteRequests\"");
    }

    #[test]
    fn unknown_name_is_rejected() {
        assert!("widgets".parse::<Collection>().is_err());
    }
}
