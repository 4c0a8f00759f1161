use std::fmt;

use strata_core::LayoutDescriptor;
use tracing::debug;

// Negotiation — Deciding an input's user layout from what the producer published
//
// A producer that participates in layout negotiation publishes the internal
// layout of its output (or, in backward, the layout it wants its gradient
// in). The consumer looks at that value once per reconfiguration:
//
//   published & accepted               → Adopted   (no conversion on the edge)
//   published, rejected, equivalent    → Retagged  (same bytes, canonical tag)
//   published, rejected, not equivalent→ Foreign   (kept; consumer converts)
//   nothing published                  → Canonical
//
// The published value is passed explicitly by the driver. No stage ever
// mutates a neighbour's metadata.

/// A layout offered by a neighbouring stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedLayout {
    pub producer: String,
    pub layout: LayoutDescriptor,
}

impl PublishedLayout {
    pub fn new(producer: impl Into<String>, layout: LayoutDescriptor) -> Self {
        PublishedLayout {
            producer: producer.into(),
            layout,
        }
    }
}

/// How an input's user layout was decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Adopted,
    Retagged,
    Foreign,
    Canonical,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Decision::Adopted => "adopted",
            Decision::Retagged => "retagged",
            Decision::Foreign => "foreign",
            Decision::Canonical => "canonical",
        };
        write!(f, "{}", s)
    }
}

/// Outcome of negotiating one input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
    pub layout: LayoutDescriptor,
    pub decision: Decision,
}

/// Pick the user layout for one input.
pub fn negotiate_input(
    consumer: &str,
    published: Option<&PublishedLayout>,
    canonical: &LayoutDescriptor,
    accepts: impl Fn(&LayoutDescriptor) -> bool,
) -> Negotiated {
    let Some(offer) = published else {
        return Negotiated {
            layout: canonical.clone(),
            decision: Decision::Canonical,
        };
    };
    if accepts(&offer.layout) {
        return Negotiated {
            layout: offer.layout.clone(),
            decision: Decision::Adopted,
        };
    }
    if offer.layout.is_physically_equivalent(canonical) {
        debug!(
            stage = consumer,
            producer = %offer.producer,
            offered = %offer.layout,
            "rejected published layout, retag as canonical"
        );
        return Negotiated {
            layout: canonical.clone(),
            decision: Decision::Retagged,
        };
    }
    debug!(
        stage = consumer,
        producer = %offer.producer,
        offered = %offer.layout,
        "rejected published layout, converting"
    );
    Negotiated {
        layout: offer.layout.clone(),
        decision: Decision::Foreign,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::Format;

    #[test]
    fn test_nothing_published_is_canonical() {
        let canon = LayoutDescriptor::canonical(&[2, 4, 3, 3]).unwrap();
        let n = negotiate_input("s", None, &canon, |_| true);
        assert_eq!(n.decision, Decision::Canonical);
        assert_eq!(n.layout, canon);
    }

    #[test]
    fn test_accepted_offer_is_adopted() {
        let canon = LayoutDescriptor::canonical(&[2, 16, 3, 3]).unwrap();
        let offer = PublishedLayout::new(
            "p",
            LayoutDescriptor::blocked(vec![2, 16, 3, 3], 8).unwrap(),
        );
        let n = negotiate_input("s", Some(&offer), &canon, |_| true);
        assert_eq!(n.decision, Decision::Adopted);
        assert_eq!(n.layout, offer.layout);
    }

    #[test]
    fn test_rejected_equivalent_offer_is_retagged() {
        let canon = LayoutDescriptor::canonical(&[2, 16, 1, 1]).unwrap();
        let offer = PublishedLayout::new(
            "p",
            LayoutDescriptor::plain(vec![2, 16, 1, 1], Format::Nhwc).unwrap(),
        );
        let n = negotiate_input("s", Some(&offer), &canon, |l| l.format() != Format::Nhwc);
        assert_eq!(n.decision, Decision::Retagged);
        assert_eq!(n.layout, canon);
    }

    #[test]
    fn test_rejected_foreign_offer_is_kept() {
        let canon = LayoutDescriptor::canonical(&[2, 16, 4, 4]).unwrap();
        let offer = PublishedLayout::new(
            "p",
            LayoutDescriptor::blocked(vec![2, 16, 4, 4], 8).unwrap(),
        );
        let n = negotiate_input("s", Some(&offer), &canon, |_| false);
        assert_eq!(n.decision, Decision::Foreign);
        assert_eq!(n.layout, offer.layout);
    }
}
