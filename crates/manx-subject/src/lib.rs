// Subject tokenization and wildcard filter matching for stream consumers.
use std::collections::HashSet;

pub const TOKEN_SEPARATOR: char = '.';
pub const WILDCARD_ONE: &str = "*";
pub const WILDCARD_TAIL: &str = ">";

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("invalid filter subject: {0:?}")]
    InvalidSubject(String),
    #[error("duplicate filter subject: {0:?}")]
    DuplicateSubject(String),
}

/// Returns true if `subject` is a well-formed filter subject: non-empty
/// tokens separated by `.`, with `>` allowed only as the final token.
pub fn valid_filter_subject(subject: &str) -> bool {
    if subject.is_empty() {
        return false;
    }
    let tokens: Vec<&str> = subject.split(TOKEN_SEPARATOR).collect();
    for (i, token) in tokens.iter().enumerate() {
        if token.is_empty() {
            return false;
        }
        if *token == WILDCARD_TAIL && i != tokens.len() - 1 {
            return false;
        }
    }
    true
}

pub fn has_wildcard(subject: &str) -> bool {
    subject
        .split(TOKEN_SEPARATOR)
        .any(|token| token == WILDCARD_ONE || token == WILDCARD_TAIL)
}

/// A single filter with its token vector cached so repeated matches stay
/// O(tokens) instead of re-splitting the subject every time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectFilter {
    subject: String,
    has_wildcard: bool,
    tokens: Vec<String>,
}

impl SubjectFilter {
    pub fn new(subject: impl Into<String>) -> Result<Self> {
        let subject = subject.into();
        if !valid_filter_subject(&subject) {
            return Err(Error::InvalidSubject(subject));
        }
        let tokens = subject
            .split(TOKEN_SEPARATOR)
            .map(str::to_string)
            .collect();
        let has_wildcard = has_wildcard(&subject);
        Ok(Self {
            subject,
            has_wildcard,
            tokens,
        })
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn has_wildcard(&self) -> bool {
        self.has_wildcard
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    /// Token-wise match of a literal subject against this filter.
    pub fn matches_tokens(&self, subject: &[&str]) -> bool {
        for (i, token) in self.tokens.iter().enumerate() {
            if token == WILDCARD_TAIL && i == self.tokens.len() - 1 {
                // Tail wildcard requires at least one remaining token.
                return subject.len() > i;
            }
            if i >= subject.len() {
                return false;
            }
            if token != WILDCARD_ONE && token != subject[i] {
                return false;
            }
        }
        self.tokens.len() == subject.len()
    }
}

/// Returns true if `sub` (possibly wildcarded) is equal to, or covered by,
/// `test` (possibly wildcarded). `sub` being a subset means every subject
/// `sub` can match is also matched by `test`.
pub fn is_subset_match(sub: &[&str], test: &[&str]) -> bool {
    for (i, t) in test.iter().enumerate() {
        if i >= sub.len() {
            return false;
        }
        if *t == WILDCARD_TAIL && i == test.len() - 1 {
            return true;
        }
        let s = sub[i];
        if *t == WILDCARD_ONE {
            // A single-token wildcard cannot cover a tail wildcard.
            if s == WILDCARD_TAIL {
                return false;
            }
        } else if s != *t {
            return false;
        }
    }
    test.len() == sub.len()
}

/// Returns true if two (possibly wildcarded) subjects can both match at
/// least one common literal subject.
pub fn subjects_collide(a: &[&str], b: &[&str]) -> bool {
    let mut i = 0;
    loop {
        match (a.get(i), b.get(i)) {
            (Some(x), Some(y)) => {
                if *x == WILDCARD_TAIL || *y == WILDCARD_TAIL {
                    return true;
                }
                if *x != WILDCARD_ONE && *y != WILDCARD_ONE && x != y {
                    return false;
                }
            }
            (None, None) => return true,
            _ => return false,
        }
        i += 1;
    }
}

pub fn tokenize(subject: &str) -> Vec<&str> {
    subject.split(TOKEN_SEPARATOR).collect()
}

/// An ordered set of subject filters. An empty set matches everything.
///
/// Literal filters are additionally indexed in a hash set so the common
/// wildcard-free case is a single lookup per match.
#[derive(Debug, Clone, Default)]
pub struct FilterSet {
    filters: Vec<SubjectFilter>,
    literals: HashSet<String>,
}

impl FilterSet {
    /// Builds a filter set, rejecting malformed and duplicate subjects.
    pub fn new<I, S>(subjects: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut filters = Vec::new();
        let mut literals = HashSet::new();
        let mut seen = HashSet::new();
        for subject in subjects {
            let filter = SubjectFilter::new(subject)?;
            if !seen.insert(filter.subject.clone()) {
                return Err(Error::DuplicateSubject(filter.subject));
            }
            if !filter.has_wildcard {
                literals.insert(filter.subject.clone());
            }
            filters.push(filter);
        }
        Ok(Self { filters, literals })
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn subjects(&self) -> impl Iterator<Item = &str> {
        self.filters.iter().map(|filter| filter.subject.as_str())
    }

    pub fn filters(&self) -> &[SubjectFilter] {
        &self.filters
    }

    /// True iff at least one filter matches `subject`. An empty filter set
    /// matches everything.
    pub fn matches(&self, subject: &str) -> bool {
        if self.filters.is_empty() {
            return true;
        }
        if self.literals.contains(subject) {
            return true;
        }
        let tokens = tokenize(subject);
        self.filters
            .iter()
            .filter(|filter| filter.has_wildcard)
            .any(|filter| filter.matches_tokens(&tokens))
    }

    /// True iff `other` (possibly wildcarded) is equal to, or a superset
    /// of, any filter in this set. An empty set never matches.
    pub fn is_equal_or_subset(&self, other: &str) -> bool {
        let other_tokens = tokenize(other);
        self.filters.iter().any(|filter| {
            let sub: Vec<&str> = filter.tokens.iter().map(String::as_str).collect();
            is_subset_match(&sub, &other_tokens)
        })
    }

    /// True iff any filter in this set can match a subject some filter in
    /// `other` also matches. Used for work-queue uniqueness checks.
    pub fn overlaps(&self, other: &FilterSet) -> bool {
        // Two unfiltered consumers trivially share the whole stream.
        if self.filters.is_empty() || other.filters.is_empty() {
            return true;
        }
        self.filters.iter().any(|a| {
            let at: Vec<&str> = a.tokens.iter().map(String::as_str).collect();
            other.filters.iter().any(|b| {
                let bt: Vec<&str> = b.tokens.iter().map(String::as_str).collect();
                subjects_collide(&at, &bt)
            })
        })
    }
}
