//! Normalization tests over captured provider payloads.

use chrono::{NaiveDate, NaiveDateTime, TimeZone, Utc};
use funev_adapters::{
    culture_all_adapter, culture_festival_adapter, newtaipei_adapter, taipei_adapter,
    tfam_activities_adapter, tfam_exhibitions_adapter, RawPayload, SourceAdapter,
};
use funev_core::RunContext;

fn fixed_context() -> RunContext {
    RunContext::begin_at(
        Utc.with_ymd_and_hms(2025, 3, 1, 6, 0, 0)
            .single()
            .expect("fixed timestamp"),
    )
}

fn payload_for(adapter: &dyn SourceAdapter, body: &str, content_type: &str) -> RawPayload {
    RawPayload {
        source_id: adapter.source_id(),
        url: format!("https://fixture.test/{}", adapter.source_id()),
        content_type: content_type.to_string(),
        body: body.to_string(),
        fetched_at: fixed_context().started_at,
    }
}

fn datetime(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(y, m, d)
        .and_then(|date| date.and_hms_opt(h, min, s))
        .expect("fixture datetime")
}

#[test]
fn culture_events_use_first_show_instance_and_absolute_images() {
    let ctx = fixed_context();
    let adapter = culture_all_adapter();
    let payload = payload_for(
        &adapter,
        include_str!("fixtures/culture_events.json"),
        "application/json",
    );

    let batch = adapter.normalize(&payload, &ctx).expect("normalize");
    assert_eq!(batch.events.len(), 2);
    // Record without a raw UID is dropped, not manufactured.
    assert_eq!(batch.skipped, 1);
    assert_eq!(batch.query_time, datetime(2025, 3, 1, 14, 0, 0));

    let market = &batch.events[0];
    assert_eq!(market.uid, "culture:64f9a2c8d1");
    assert_eq!(market.title, "夜光森林市集");
    assert_eq!(market.organizer, "文化部");
    // The first of two show instances wins.
    assert_eq!(market.start_date, Some(datetime(2025, 3, 1, 0, 0, 0)));
    assert_eq!(market.end_date, Some(datetime(2025, 3, 9, 0, 0, 0)));
    assert_eq!(market.address, "臺北市信義區市府路1號");
    assert_eq!(market.location, "市民廣場");
    assert_eq!(market.latitude, Some(25.0375));
    assert_eq!(market.longitude, Some(121.5637));
    assert_eq!(market.ticket_price, "免費");
    assert_eq!(
        market.image_url,
        "https://cloud.culture.tw/activity/images/64f9a2c8d1.jpg"
    );
    assert_eq!(market.related_link, "");

    let puppet = &batch.events[1];
    assert_eq!(puppet.uid, "culture:77ab34e0f2");
    // No show instances: venue fields degrade to empty, dates to None.
    assert_eq!(puppet.address, "");
    assert_eq!(puppet.start_date, None);
    assert_eq!(puppet.latitude, None);
    // Already-absolute image URLs are left alone.
    assert_eq!(
        puppet.image_url,
        "https://cloud.culture.tw/activity/images/77ab34e0f2.jpg"
    );
}

#[test]
fn culture_festival_records_map_flat_fields() {
    let ctx = fixed_context();
    let adapter = culture_festival_adapter();
    let payload = payload_for(
        &adapter,
        include_str!("fixtures/culture_festival.json"),
        "application/json",
    );

    let batch = adapter.normalize(&payload, &ctx).expect("normalize");
    assert_eq!(batch.events.len(), 2);
    assert_eq!(batch.skipped, 0);

    let lantern = &batch.events[0];
    assert_eq!(lantern.uid, "culture:F2025_0012");
    assert_eq!(lantern.title, "平溪天燈節");
    assert_eq!(lantern.organizer, "新北市政府觀光旅遊局");
    assert_eq!(lantern.related_link, "https://www.ntpc.gov.tw/skylantern");
    assert_eq!(lantern.latitude, Some(25.0259));
    assert_eq!(lantern.longitude, Some(121.7385));
    // Festival venue doubles as both address and location.
    assert_eq!(lantern.address, lantern.location);
    assert_eq!(
        lantern.image_url,
        "https://cloud.culture.tw/festival/images/sky2025.jpg"
    );

    let mazu = &batch.events[1];
    assert_eq!(mazu.start_date, Some(datetime(2025, 4, 4, 23, 0, 0)));
    // Out-of-range latitude degrades to None without touching the record.
    assert_eq!(mazu.latitude, None);
    assert_eq!(mazu.longitude, Some(120.6224));
    assert_eq!(mazu.ticket_price, "");
}

#[test]
fn taipei_records_survive_bom_and_missing_image_arrays() {
    let ctx = fixed_context();
    let adapter = taipei_adapter();
    let body = format!("\u{feff}{}", include_str!("fixtures/taipei_featured.json"));
    let payload = payload_for(&adapter, &body, "application/json");

    let batch = adapter.normalize(&payload, &ctx).expect("normalize");
    assert_eq!(batch.events.len(), 2);
    assert_eq!(batch.skipped, 0);

    let lantern = &batch.events[0];
    assert_eq!(lantern.uid, "taipei:2025020800123");
    assert_eq!(lantern.start_date, Some(datetime(2025, 2, 8, 18, 0, 0)));
    assert_eq!(lantern.end_date, Some(datetime(2025, 2, 16, 22, 0, 0)));
    assert_eq!(lantern.related_link, "https://www.gov.taipei/lantern2025");
    // First image of the nested array.
    assert_eq!(
        lantern.image_url,
        "https://www.gov.taipei/images/lantern-main.jpg"
    );
    assert_eq!(lantern.latitude, None);

    let picnic = &batch.events[1];
    // Empty image array degrades to an empty URL instead of failing the
    // record.
    assert_eq!(picnic.image_url, "");
    assert_eq!(picnic.start_date, Some(datetime(2025, 3, 22, 0, 0, 0)));
}

#[test]
fn newtaipei_csv_skips_unreadable_rows_individually() {
    let ctx = fixed_context();
    let adapter = newtaipei_adapter();
    let payload = payload_for(
        &adapter,
        include_str!("fixtures/newtaipei_activities.csv"),
        "text/csv",
    );

    let batch = adapter.normalize(&payload, &ctx).expect("normalize");
    assert_eq!(batch.events.len(), 2);
    assert_eq!(batch.skipped, 1);

    let bridge = &batch.events[0];
    assert_eq!(bridge.uid, "new_taipei:a1b2c3");
    assert_eq!(bridge.title, "新月橋光雕展演");
    assert_eq!(bridge.organizer, "新北市政府高灘地工程管理處");
    assert_eq!(bridge.start_date, Some(datetime(2025, 4, 1, 0, 0, 0)));
    assert_eq!(bridge.related_link, "https://www.ntpc.gov.tw/moonbridge");
    // The dataset carries no price or coordinates.
    assert_eq!(bridge.ticket_price, "");
    assert_eq!(bridge.latitude, None);
    assert_eq!(bridge.longitude, None);
}

#[test]
fn newtaipei_csv_and_json_bodies_normalize_identically() {
    let ctx = fixed_context();
    let adapter = newtaipei_adapter();

    let csv_body = format!(
        "\u{feff}{}",
        include_str!("fixtures/newtaipei_activities.csv")
    );
    let csv_batch = adapter
        .normalize(&payload_for(&adapter, &csv_body, "text/csv"), &ctx)
        .expect("csv normalize");

    let json_batch = adapter
        .normalize(
            &payload_for(
                &adapter,
                include_str!("fixtures/newtaipei_activities.json"),
                "application/json",
            ),
            &ctx,
        )
        .expect("json normalize");

    assert_eq!(csv_batch.events, json_batch.events);
    assert_eq!(csv_batch.skipped, 1);
    assert_eq!(json_batch.skipped, 0);
}

#[test]
fn tfam_exhibitions_carry_fixed_venue_and_envelope_totals() {
    let ctx = fixed_context();
    let adapter = tfam_exhibitions_adapter();
    let payload = payload_for(
        &adapter,
        include_str!("fixtures/tfam_exhibitions.json"),
        "application/json",
    );

    let batch = adapter.normalize(&payload, &ctx).expect("normalize");
    assert_eq!(batch.events.len(), 2);
    assert_eq!(batch.total, 42);
    assert_eq!(batch.limit, 10);
    assert_eq!(batch.offset, 0);
    assert_eq!(batch.sort_order, "_id asc");

    let kentridge = &batch.events[0];
    assert_eq!(kentridge.uid, "tfam:1");
    assert_eq!(kentridge.organizer, "臺北市立美術館");
    assert_eq!(kentridge.address, "臺北市中山區中山北路三段181號");
    assert_eq!(kentridge.location, "臺北市立美術館");
    assert_eq!(kentridge.latitude, Some(25.072943));
    assert_eq!(kentridge.longitude, Some(121.524536));
    assert_eq!(kentridge.start_date, Some(datetime(2025, 5, 3, 0, 0, 0)));
    assert_eq!(kentridge.ticket_price, "全票30元");
}

#[test]
fn tfam_activities_parse_english_month_dates() {
    let ctx = fixed_context();
    let adapter = tfam_activities_adapter();
    let payload = payload_for(
        &adapter,
        include_str!("fixtures/tfam_activities.json"),
        "application/json",
    );

    let batch = adapter.normalize(&payload, &ctx).expect("normalize");
    assert_eq!(batch.events.len(), 1);
    assert_eq!(batch.total, 3);

    let colorlab = &batch.events[0];
    assert_eq!(colorlab.uid, "tfam:901");
    assert_eq!(colorlab.start_date, Some(datetime(2025, 1, 18, 0, 0, 0)));
    assert_eq!(colorlab.end_date, Some(datetime(2025, 6, 29, 0, 0, 0)));
}

#[test]
fn malformed_payload_is_a_source_level_failure() {
    let ctx = fixed_context();
    let adapter = taipei_adapter();
    let payload = payload_for(&adapter, "<html>maintenance page</html>", "text/html");

    let err = adapter.normalize(&payload, &ctx).unwrap_err();
    assert!(err.to_string().contains("taipei:featured"));
}
