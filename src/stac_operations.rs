use crate::collection::{CollectionFilter, SceneMetadata};
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use log::{debug, info};
use serde_json::{json, Value};
use stac::{Item, ItemCollection};

pub const SEARCH_API: &str = "https://earth-search.aws.element84.com/v1/search";
pub const SENTINEL_2_L2A: &str = "sentinel-2-l2a";

const PAGE_LIMIT: u32 = 100;

/// Body of a STAC item search matching `filter` in `collection`.
pub fn search_body(collection: &str, filter: &CollectionFilter) -> Value {
    json!({
        "collections": [collection],
        "bbox": filter.region.bounds().to_stac(),
        "datetime": filter.stac_datetime(),
        "query": { "eo:cloud_cover": { "lt": filter.max_cloud_cover } },
        "limit": PAGE_LIMIT,
    })
}

enum NextPage {
    Get(String),
    Post(String, Value),
}

fn next_page(page: &Value, previous_body: &Value) -> Option<NextPage> {
    let link = page
        .get("links")?
        .as_array()?
        .iter()
        .find(|l| l.get("rel").and_then(Value::as_str) == Some("next"))?;
    let href = link.get("href")?.as_str()?.to_owned();
    match link.get("method").and_then(Value::as_str) {
        Some("POST") => {
            let mut body = previous_body.clone();
            if let (Some(target), Some(Value::Object(extra))) = (body.as_object_mut(), link.get("body")) {
                let merge = link.get("merge").and_then(Value::as_bool).unwrap_or(false);
                if !merge {
                    target.clear();
                }
                for (k, v) in extra {
                    target.insert(k.clone(), v.clone());
                }
            }
            Some(NextPage::Post(href, body))
        }
        _ => Some(NextPage::Get(href)),
    }
}

/// Search `api` page by page and return every item found.
pub async fn search(api: &str, body: Value) -> Result<Vec<Item>> {
    let client = reqwest::Client::new();
    let mut items = vec![];
    let mut request = NextPage::Post(api.to_owned(), body);

    loop {
        let (page, sent_body): (Value, Value) = match request {
            NextPage::Post(url, body) => {
                let page = client
                    .post(&url)
                    .json(&body)
                    .send()
                    .await?
                    .error_for_status()?
                    .json()
                    .await?;
                (page, body)
            }
            NextPage::Get(url) => {
                let page = client.get(&url).send().await?.error_for_status()?.json().await?;
                (page, Value::Null)
            }
        };

        let next = next_page(&page, &sent_body);
        let collection: ItemCollection = serde_json::from_value(page)?;
        debug!("Search page returned {} items", collection.items.len());
        let returned = collection.items.len();
        items.extend(collection.items);

        match next {
            Some(n) if returned > 0 => request = n,
            _ => break,
        }
    }

    info!("STAC search returned {} items", items.len());
    Ok(items)
}

/// Scene metadata from the `datetime`, `eo:cloud_cover` and `bbox` fields of
/// an item.
pub fn scene_metadata(item: &Item) -> Result<SceneMetadata> {
    let value = serde_json::to_value(item)?;
    let datetime = value
        .pointer("/properties/datetime")
        .and_then(Value::as_str)
        .ok_or(anyhow!("Item {} has no datetime", item.id))?;
    let acquired = DateTime::parse_from_rfc3339(datetime)?.with_timezone(&Utc);
    let cloud_cover = value
        .pointer("/properties/eo:cloud_cover")
        .and_then(Value::as_f64)
        .ok_or(anyhow!("Item {} has no eo:cloud_cover", item.id))?;
    let bbox = value
        .get("bbox")
        .and_then(Value::as_array)
        .map(|b| b.iter().filter_map(Value::as_f64).collect::<Vec<_>>())
        .ok_or(anyhow!("Item {} has no bbox", item.id))?;
    let footprint = crate::study_area::BoundingBox::from_stac(&bbox)
        .ok_or(anyhow!("Item {} has a malformed bbox", item.id))?;

    Ok(SceneMetadata {
        id: item.id.to_owned(),
        acquired,
        cloud_cover,
        footprint,
    })
}

pub fn asset_href<'a>(item: &'a Item, key: &str) -> Option<&'a str> {
    item.assets.get(key).map(|asset| asset.href.as_str())
}
