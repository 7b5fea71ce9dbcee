//! `ContentDirectory:1` (spec.md §4.7). `Browse`/`Search` results are
//! DIDL-Lite XML fragments, parsed on demand by [`crate::didl`] rather than
//! eagerly — a client that only needs `TotalMatches` shouldn't pay for
//! parsing every item.

use crate::error::{Error, Result};
use crate::service_client::{ServiceClient, ServiceTraits};
use crate::service_device::{DeviceServiceTraits, ServiceDevice};
use crate::soap::UpnpError;
use std::fmt;
use std::sync::{Arc, Mutex};

pub const SERVICE_TYPE: &str = "urn:schemas-upnp-org:service:ContentDirectory:1";
pub const SERVICE_ID: &str = "urn:upnp-org:serviceId:ContentDirectory";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrowseFlag {
    BrowseMetadata,
    BrowseDirectChildren,
}

impl fmt::Display for BrowseFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BrowseFlag::BrowseMetadata => "BrowseMetadata",
            BrowseFlag::BrowseDirectChildren => "BrowseDirectChildren",
        })
    }
}

impl std::str::FromStr for BrowseFlag {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "BrowseMetadata" => Ok(BrowseFlag::BrowseMetadata),
            "BrowseDirectChildren" => Ok(BrowseFlag::BrowseDirectChildren),
            other => Err(Error::InvalidArguments(format!("invalid BrowseFlag: {other:?}"))),
        }
    }
}

/// One element of a parsed `SortCriteria` CSV: a property name and its
/// direction. `+`/`-` is required on every element (spec.md §4.7).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    pub property: String,
    pub descending: bool,
}

/// Parses the `SortCriteria` argument. An empty string means "unsorted". An
/// empty element between commas (`"+dc:title,,+upnp:class"`) is rejected
/// with `InvalidArguments`, matching spec.md §4.7's `Browse` edge case.
pub fn parse_sort_criteria(csv: &str) -> Result<Vec<SortKey>> {
    if csv.trim().is_empty() {
        return Ok(Vec::new());
    }
    csv.split(',')
        .map(|raw| {
            if raw.is_empty() {
                return Err(Error::InvalidArguments("empty SortCriteria element".into()));
            }
            let mut chars = raw.chars();
            let sign = chars.next().expect("non-empty");
            let property: String = chars.collect();
            if property.is_empty() {
                return Err(Error::InvalidArguments(format!("SortCriteria element missing property: {raw:?}")));
            }
            match sign {
                '+' => Ok(SortKey { property, descending: false }),
                '-' => Ok(SortKey { property, descending: true }),
                _ => Err(Error::InvalidArguments(format!("SortCriteria element missing +/- sign: {raw:?}"))),
            }
        })
        .collect()
}

/// Arguments to a `Browse` action, with `SortCriteria` already parsed and
/// validated.
#[derive(Debug, Clone)]
pub struct BrowseArgs {
    pub object_id: String,
    pub browse_flag: BrowseFlag,
    pub filter: String,
    pub starting_index: u32,
    pub requested_count: u32,
    pub sort_criteria: Vec<SortKey>,
}

/// Arguments to a `Search` action, with `SortCriteria` already parsed and
/// validated.
#[derive(Debug, Clone)]
pub struct SearchArgs {
    pub container_id: String,
    pub search_criteria: String,
    pub filter: String,
    pub starting_index: u32,
    pub requested_count: u32,
    pub sort_criteria: Vec<SortKey>,
}

/// The actual content tree lives outside the crate's core (spec.md §1: a
/// renderer/server's media library is an application concern); a device
/// supplies one of these to answer `Browse`/`Search` once argument parsing
/// and validation — the part genuinely owned by this module — has passed.
pub trait ContentProvider: Send + Sync {
    fn browse(&self, args: &BrowseArgs) -> std::result::Result<BrowseResult, UpnpError>;
    fn search(&self, args: &SearchArgs) -> std::result::Result<BrowseResult, UpnpError>;
}

#[derive(Debug, Clone)]
pub struct BrowseResult {
    pub result: String,
    pub number_returned: u32,
    pub total_matches: u32,
    pub update_id: u32,
}

pub struct Traits;
impl ServiceTraits for Traits {
    const SERVICE_TYPE: &'static str = SERVICE_TYPE;
}
impl DeviceServiceTraits for Traits {
    const SERVICE_TYPE: &'static str = SERVICE_TYPE;
    const SERVICE_ID: &'static str = SERVICE_ID;
}

pub type Client = ServiceClient<Traits>;

impl Client {
    pub async fn get_system_update_id(&self) -> Result<u32> {
        let out = self.invoke("GetSystemUpdateID", &[]).await?;
        parse_u32(&out, "Id")
    }

    pub async fn get_search_capabilities(&self) -> Result<String> {
        let out = self.invoke("GetSearchCapabilities", &[]).await?;
        Ok(field(&out, "SearchCaps"))
    }

    pub async fn get_sort_capabilities(&self) -> Result<String> {
        let out = self.invoke("GetSortCapabilities", &[]).await?;
        Ok(field(&out, "SortCaps"))
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn browse(
        &self,
        object_id: &str,
        browse_flag: BrowseFlag,
        filter: &str,
        starting_index: u32,
        requested_count: u32,
        sort_criteria: &str,
    ) -> Result<BrowseResult> {
        let out = self
            .invoke(
                "Browse",
                &[
                    ("ObjectID".into(), object_id.to_string()),
                    ("BrowseFlag".into(), browse_flag.to_string()),
                    ("Filter".into(), filter.to_string()),
                    ("StartingIndex".into(), starting_index.to_string()),
                    ("RequestedCount".into(), requested_count.to_string()),
                    ("SortCriteria".into(), sort_criteria.to_string()),
                ],
            )
            .await?;

        Ok(BrowseResult {
            result: field(&out, "Result"),
            number_returned: parse_u32(&out, "NumberReturned")?,
            total_matches: parse_u32(&out, "TotalMatches")?,
            update_id: parse_u32(&out, "UpdateID")?,
        })
    }

    pub async fn search(
        &self,
        container_id: &str,
        search_criteria: &str,
        filter: &str,
        starting_index: u32,
        requested_count: u32,
        sort_criteria: &str,
    ) -> Result<BrowseResult> {
        let out = self
            .invoke(
                "Search",
                &[
                    ("ContainerID".into(), container_id.to_string()),
                    ("SearchCriteria".into(), search_criteria.to_string()),
                    ("Filter".into(), filter.to_string()),
                    ("StartingIndex".into(), starting_index.to_string()),
                    ("RequestedCount".into(), requested_count.to_string()),
                    ("SortCriteria".into(), sort_criteria.to_string()),
                ],
            )
            .await?;

        Ok(BrowseResult {
            result: field(&out, "Result"),
            number_returned: parse_u32(&out, "NumberReturned")?,
            total_matches: parse_u32(&out, "TotalMatches")?,
            update_id: parse_u32(&out, "UpdateID")?,
        })
    }
}

/// Device-side `ContentDirectory`: the variable store plus a pluggable
/// [`ContentProvider`] that answers `Browse`/`Search` against the
/// application's actual media tree.
pub struct Device {
    base: ServiceDevice<Traits>,
    provider: Mutex<Option<Arc<dyn ContentProvider>>>,
}

impl Device {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { base: ServiceDevice::new(), provider: Mutex::new(None) })
    }

    pub fn base(&self) -> &ServiceDevice<Traits> {
        &self.base
    }

    pub fn set_content_provider(&self, provider: Arc<dyn ContentProvider>) {
        *self.provider.lock().expect("content provider mutex poisoned") = Some(provider);
    }

    pub fn init(&self, search_caps: &str, sort_caps: &str) {
        self.base.set_variable(0, "SearchCapabilities", search_caps);
        self.base.set_variable(0, "SortCapabilities", sort_caps);
        self.base.set_variable(0, "SystemUpdateID", "0");
    }

    /// Bumps `SystemUpdateID` and notifies subscribers directly —
    /// `ContentDirectory` doesn't batch through `LastChange`.
    pub async fn bump_system_update_id(&self) -> u32 {
        let next = self
            .base
            .get_variable(0, "SystemUpdateID")
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(0)
            .wrapping_add(1);
        self.base.set_variable(0, "SystemUpdateID", next.to_string());
        self.base.notify_change(vec![("SystemUpdateID".to_string(), next.to_string())]).await;
        next
    }

    pub fn dispatch(&self, action: &str, args: &[(String, String)]) -> std::result::Result<Vec<(String, String)>, UpnpError> {
        match action {
            "GetSearchCapabilities" => Ok(vec![("SearchCaps".into(), self.base.get_variable(0, "SearchCapabilities").unwrap_or_default())]),
            "GetSortCapabilities" => Ok(vec![("SortCaps".into(), self.base.get_variable(0, "SortCapabilities").unwrap_or_default())]),
            "GetSystemUpdateID" => Ok(vec![("Id".into(), self.base.get_variable(0, "SystemUpdateID").unwrap_or_else(|| "0".into()))]),
            "Browse" => {
                let sort_criteria = parse_sort_criteria(&field(args, "SortCriteria"))?;
                let browse_flag: BrowseFlag = field(args, "BrowseFlag").parse()?;
                let browse_args = BrowseArgs {
                    object_id: field(args, "ObjectID"),
                    browse_flag,
                    filter: field(args, "Filter"),
                    starting_index: parse_u32(args, "StartingIndex")?,
                    requested_count: parse_u32(args, "RequestedCount")?,
                    sort_criteria,
                };
                let provider = self.provider.lock().expect("content provider mutex poisoned").clone();
                let provider = provider.ok_or_else(|| UpnpError::new(501, "no content provider installed"))?;
                let result = provider.browse(&browse_args)?;
                Ok(vec![
                    ("Result".into(), result.result),
                    ("NumberReturned".into(), result.number_returned.to_string()),
                    ("TotalMatches".into(), result.total_matches.to_string()),
                    ("UpdateID".into(), result.update_id.to_string()),
                ])
            }
            "Search" => {
                let sort_criteria = parse_sort_criteria(&field(args, "SortCriteria"))?;
                let search_args = SearchArgs {
                    container_id: field(args, "ContainerID"),
                    search_criteria: field(args, "SearchCriteria"),
                    filter: field(args, "Filter"),
                    starting_index: parse_u32(args, "StartingIndex")?,
                    requested_count: parse_u32(args, "RequestedCount")?,
                    sort_criteria,
                };
                let provider = self.provider.lock().expect("content provider mutex poisoned").clone();
                let provider = provider.ok_or_else(|| UpnpError::new(501, "no content provider installed"))?;
                let result = provider.search(&search_args)?;
                Ok(vec![
                    ("Result".into(), result.result),
                    ("NumberReturned".into(), result.number_returned.to_string()),
                    ("TotalMatches".into(), result.total_matches.to_string()),
                    ("UpdateID".into(), result.update_id.to_string()),
                ])
            }
            _ => Err(UpnpError::code_only(401)),
        }
    }
}

fn field(args: &[(String, String)], name: &str) -> String {
    args.iter().find(|(k, _)| k == name).map(|(_, v)| v.clone()).unwrap_or_default()
}

fn parse_u32(args: &[(String, String)], name: &str) -> Result<u32> {
    field(args, name)
        .parse()
        .map_err(|_| Error::InvalidArguments(format!("malformed {name}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn browse_flag_renders_wire_values() {
        assert_eq!(BrowseFlag::BrowseMetadata.to_string(), "BrowseMetadata");
        assert_eq!(BrowseFlag::BrowseDirectChildren.to_string(), "BrowseDirectChildren");
    }

    #[test]
    fn parse_u32_rejects_non_numeric() {
        let args = vec![("TotalMatches".to_string(), "not-a-number".to_string())];
        assert!(parse_u32(&args, "TotalMatches").is_err());
    }

    #[test]
    fn parse_sort_criteria_accepts_multiple_elements() {
        let keys = parse_sort_criteria("+dc:title,-upnp:originalTrackNumber").unwrap();
        assert_eq!(
            keys,
            vec![
                SortKey { property: "dc:title".into(), descending: false },
                SortKey { property: "upnp:originalTrackNumber".into(), descending: true },
            ]
        );
    }

    #[test]
    fn parse_sort_criteria_treats_blank_string_as_unsorted() {
        assert_eq!(parse_sort_criteria("").unwrap(), Vec::new());
        assert_eq!(parse_sort_criteria("   ").unwrap(), Vec::new());
    }

    #[test]
    fn parse_sort_criteria_rejects_empty_element() {
        assert!(parse_sort_criteria("+dc:title,,+upnp:class").is_err());
    }

    #[test]
    fn parse_sort_criteria_rejects_missing_sign() {
        assert!(parse_sort_criteria("dc:title").is_err());
    }

    struct FakeProvider {
        result: BrowseResult,
    }

    impl ContentProvider for FakeProvider {
        fn browse(&self, _args: &BrowseArgs) -> std::result::Result<BrowseResult, UpnpError> {
            Ok(self.result.clone())
        }

        fn search(&self, _args: &SearchArgs) -> std::result::Result<BrowseResult, UpnpError> {
            Ok(self.result.clone())
        }
    }

    fn browse_args(extra: &[(&str, &str)]) -> Vec<(String, String)> {
        let mut args = vec![
            ("ObjectID".to_string(), "0".to_string()),
            ("BrowseFlag".to_string(), "BrowseDirectChildren".to_string()),
            ("Filter".to_string(), "*".to_string()),
            ("StartingIndex".to_string(), "0".to_string()),
            ("RequestedCount".to_string(), "0".to_string()),
            ("SortCriteria".to_string(), "".to_string()),
        ];
        for (k, v) in extra {
            args.retain(|(existing, _)| existing != k);
            args.push((k.to_string(), v.to_string()));
        }
        args
    }

    #[test]
    fn dispatch_browse_delegates_to_content_provider() {
        let device = Device::new();
        device.init("", "dc:title");
        device.set_content_provider(Arc::new(FakeProvider {
            result: BrowseResult { result: "<DIDL-Lite/>".into(), number_returned: 0, total_matches: 0, update_id: 0 },
        }));
        let out = device.dispatch("Browse", &browse_args(&[])).unwrap();
        assert!(out.contains(&("Result".to_string(), "<DIDL-Lite/>".to_string())));
    }

    #[test]
    fn dispatch_browse_without_provider_faults_action_failed() {
        let device = Device::new();
        device.init("", "");
        let err = device.dispatch("Browse", &browse_args(&[])).unwrap_err();
        assert_eq!(err.code, 501);
    }

    #[test]
    fn dispatch_browse_with_malformed_sort_criteria_faults_invalid_args() {
        let device = Device::new();
        device.init("", "");
        device.set_content_provider(Arc::new(FakeProvider {
            result: BrowseResult { result: String::new(), number_returned: 0, total_matches: 0, update_id: 0 },
        }));
        let err = device.dispatch("Browse", &browse_args(&[("SortCriteria", "dc:title")])).unwrap_err();
        assert_eq!(err.code, 402);
    }

    #[test]
    fn dispatch_unknown_action_is_unsupported() {
        let device = Device::new();
        device.init("", "");
        let err = device.dispatch("DestroyObject", &[]).unwrap_err();
        assert_eq!(err.code, 401);
    }
}
