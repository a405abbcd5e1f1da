use std::{cmp::Ordering, collections::BTreeMap};

use serde::{Deserialize, Serialize};

/// The floating tag that aliases the newest published version
pub const LATEST: &str = "latest";

/// One (image, tag) pairing discovered in the registry
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ImageRecord {
    pub name: String,
    pub version: String,
    #[serde(rename = "sha256", default)]
    pub digest: String,
}

impl ImageRecord {
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        digest: impl Into<String>,
    ) -> Self {
        ImageRecord {
            name: name.into(),
            version: version.into(),
            digest: digest.into(),
        }
    }
}

/// When to keep the `latest` tag next to the numeric versions
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum LatestPolicy {
    /// Only when `latest` and the highest version share a digest
    Strict,
    /// As `Strict`, or when there is no numeric tag to compare against
    #[default]
    Fallback,
}

/// Retention rules applied to every image
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetentionPolicy {
    /// Number of numeric tags to retain
    pub keep: usize,
    pub latest: LatestPolicy,
    /// Report images whose retained list came out empty
    pub keep_empty: bool,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        RetentionPolicy {
            keep: 2,
            latest: LatestPolicy::default(),
            keep_empty: true,
        }
    }
}

/// Value of a tag made only of decimal digits, of any length.
///
/// Holds the significant digits (leading zeros stripped, empty for zero) and
/// orders by digit count, then digit by digit.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct NumericVersion<'a>(&'a str);

const ZERO: NumericVersion<'static> = NumericVersion("");

impl<'a> NumericVersion<'a> {
    /// Canonical decimal form, without leading zeros
    pub fn digits(&self) -> &'a str {
        if self.0.is_empty() { "0" } else { self.0 }
    }
}

impl Ord for NumericVersion<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .len()
            .cmp(&other.0.len())
            .then_with(|| self.0.cmp(other.0))
    }
}

impl PartialOrd for NumericVersion<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Numeric value of a tag made only of decimal digits.
///
/// Signs, whitespace and separators make a tag non-numeric.
pub fn numeric_version(tag: &str) -> Option<NumericVersion<'_>> {
    if tag.is_empty() || !tag.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(NumericVersion(tag.trim_start_matches('0')))
}

/// Sort key of a tag: non-numeric tags rank as `0`, level with a literal `"0"`.
fn sort_key(tag: &str) -> NumericVersion<'_> {
    numeric_version(tag).unwrap_or(ZERO)
}

fn digests_match(latest: Option<&str>, version: Option<&str>) -> bool {
    match (latest, version) {
        (Some(a), Some(b)) => !a.is_empty() && a == b,
        _ => false,
    }
}

/// Reduce the tags of one image to the retained set.
///
/// The result holds at most `policy.keep` tags in descending numeric order,
/// preceded by `latest` when the policy allows it.
pub fn reduce<S: AsRef<str>>(
    tags: &[S],
    latest_digest: Option<&str>,
    version_digest: Option<&str>,
    policy: &RetentionPolicy,
) -> Vec<String> {
    if tags.is_empty() {
        return Vec::new();
    }

    let mut has_latest = false;
    let mut version_tags = Vec::with_capacity(tags.len());
    for tag in tags {
        let tag: &str = tag.as_ref();
        if tag == LATEST {
            has_latest = true;
        } else {
            version_tags.push(tag);
        }
    }
    let has_numeric = version_tags.iter().any(|t| numeric_version(t).is_some());

    // stable: equal keys keep their discovery order
    version_tags.sort_by(|a, b| sort_key(b).cmp(&sort_key(a)));
    version_tags.truncate(policy.keep);

    let keep_latest = has_latest
        && match policy.latest {
            LatestPolicy::Strict => digests_match(latest_digest, version_digest),
            LatestPolicy::Fallback => {
                digests_match(latest_digest, version_digest) || !has_numeric
            }
        };

    let mut retained = Vec::with_capacity(version_tags.len() + 1);
    if keep_latest {
        retained.push(LATEST.to_string());
    }
    retained.extend(version_tags.into_iter().map(str::to_string));
    retained
}

/// Tags and digests gathered for one image name
#[derive(Debug, Default)]
struct ImageGroup<'a> {
    tags: Vec<&'a str>,
    latest_digest: Option<&'a str>,
    version_digest: Option<&'a str>,
    highest: Option<NumericVersion<'a>>,
}

impl<'a> ImageGroup<'a> {
    fn push(&mut self, record: &'a ImageRecord) {
        self.tags.push(record.version.as_str());
        if record.version == LATEST {
            self.latest_digest = Some(record.digest.as_str());
        } else if let Some(num) = numeric_version(&record.version) {
            if self.highest.is_none_or(|highest| num > highest) {
                self.highest = Some(num);
                self.version_digest = Some(record.digest.as_str());
            }
        }
    }
}

/// Group records by image name and reduce each group's tags.
pub fn group(records: &[ImageRecord], policy: &RetentionPolicy) -> BTreeMap<String, Vec<String>> {
    let mut groups: BTreeMap<&str, ImageGroup> = BTreeMap::new();
    for record in records {
        groups.entry(&record.name).or_default().push(record);
    }

    groups
        .into_iter()
        .filter_map(|(name, group)| {
            let tags = reduce(
                &group.tags,
                group.latest_digest,
                group.version_digest,
                policy,
            );
            (policy.keep_empty || !tags.is_empty()).then(|| (name.to_string(), tags))
        })
        .collect()
}
