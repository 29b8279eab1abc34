//! Search: a well-formed empty result. Content search is out of scope,
//! but clients that offer a search box must not get an error back.

use std::sync::Arc;

use anyhow::Result;

use esta_wbxml::{self as wbxml, pages, Element};

use crate::eas::{CommandOutcome, EasEngine, RequestContext, RequestLog};

pub async fn handle(
    _engine: &Arc<EasEngine>,
    _ctx: &RequestContext,
    doc: Option<&Element>,
    log: &mut RequestLog,
) -> Result<CommandOutcome> {
    if doc.map(|d| d.tag) != Some("Search") {
        log.status = Some("2".to_string());
        let response = Element::new(pages::SEARCH, "Search").str("Status", "2");
        return Ok(CommandOutcome::Wbxml(wbxml::encode(&response)?));
    }

    log.status = Some("1".to_string());
    let response = Element::new(pages::SEARCH, "Search")
        .str("Status", "1")
        .node(
            Element::new(pages::SEARCH, "Response").node(
                Element::new(pages::SEARCH, "Store")
                    .str("Status", "1")
                    .str("Total", "0"),
            ),
        );
    Ok(CommandOutcome::Wbxml(wbxml::encode(&response)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_result_document_is_well_formed() {
        let response = Element::new(pages::SEARCH, "Search")
            .str("Status", "1")
            .node(
                Element::new(pages::SEARCH, "Response").node(
                    Element::new(pages::SEARCH, "Store")
                        .str("Status", "1")
                        .str("Total", "0"),
                ),
            );
        let bytes = wbxml::encode(&response).unwrap();
        let parsed = wbxml::decode(&bytes).unwrap();
        assert_eq!(
            parsed
                .child("Response")
                .unwrap()
                .child("Store")
                .unwrap()
                .child_text("Total"),
            Some("0")
        );
    }
}
