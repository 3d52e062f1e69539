use crate::change::ChangeReason;
use crate::error::Result;

/// A lazily produced, single-pass sequence of change reasons from one rule.
pub type ChangeIter<'a> = Box<dyn Iterator<Item = Result<ChangeReason>> + 'a>;

pub const DEFAULT_MAX_REASONS: usize = 3;

/// The first reasons reported by a sequence of rules.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChangeSummary {
    reasons: Vec<ChangeReason>,
    truncated: bool,
}

impl ChangeSummary {
    pub fn is_up_to_date(&self) -> bool {
        self.reasons.is_empty() && !self.truncated
    }

    pub fn reasons(&self) -> &[ChangeReason] {
        &self.reasons
    }

    /// Whether more reasons existed than were kept.
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn into_reasons(self) -> Vec<ChangeReason> {
        self.reasons
    }
}

/// Consumes `rules` left to right, keeping at most `max_reasons` reasons.
///
/// Rules are pulled lazily and at most one reason past the cap is produced, so a `max_reasons` of
/// zero still answers whether anything changed. The first error aborts the summary.
pub fn summarize<'a>(rules: impl IntoIterator<Item = ChangeIter<'a>>, max_reasons: usize) -> Result<ChangeSummary> {
    let mut summary = ChangeSummary::default();
    for rule in rules {
        for change in rule {
            let change = change?;
            if summary.reasons.len() == max_reasons {
                summary.truncated = true;
                return Ok(summary);
            }
            summary.reasons.push(change);
        }
    }
    Ok(summary)
}

/// The first reason reported by `rules`, if any.
pub fn first_change<'a>(rules: impl IntoIterator<Item = ChangeIter<'a>>) -> Result<Option<ChangeReason>> {
    for rule in rules {
        if let Some(change) = rule.into_iter().next() {
            return change.map(Some);
        }
    }
    Ok(None)
}
