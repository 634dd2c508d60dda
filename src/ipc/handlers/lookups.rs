use crate::config::{SETTING_COUNTRIES, SETTING_NATURES, SETTING_STATUSES};
use crate::db;
use crate::ipc::error::{query_err, write_err, HandlerErr};
use crate::ipc::helpers::{
    collect_rows, get_optional_text, get_required_i64, get_required_str, get_text, with_conn,
    with_user, HandlerResult, BATCH_CODE_SQL,
};
use crate::ipc::types::{AppState, Request, Session};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

fn id_name_str(r: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({ "id": r.get::<_, String>(0)?, "name": r.get::<_, String>(1)? }))
}

fn id_name_int(r: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({ "id": r.get::<_, i64>(0)?, "name": r.get::<_, String>(1)? }))
}

fn items(v: Vec<serde_json::Value>) -> HandlerResult {
    Ok(json!({ "items": v }))
}

fn lookup_batches(conn: &Connection, params: &serde_json::Value) -> HandlerResult {
    let class_name_id = get_required_str(params, "classNameId")?;
    items(collect_rows(
        conn,
        &format!(
            "SELECT cb.id, {} AS name FROM class_batches cb
             JOIN class_names cn ON cn.id = cb.class_name_id
             WHERE cb.class_name_id = ?
             ORDER BY name",
            BATCH_CODE_SQL
        ),
        [&class_name_id],
        id_name_str,
    )?)
}

fn lookup_regions(conn: &Connection, params: &serde_json::Value) -> HandlerResult {
    let class_batch_id = get_required_str(params, "classBatchId")?;
    items(collect_rows(
        conn,
        "SELECT id, section FROM class_regions WHERE class_batch_id = ? ORDER BY section",
        [&class_batch_id],
        id_name_str,
    )?)
}

fn lookup_groups(conn: &Connection, params: &serde_json::Value) -> HandlerResult {
    let class_region_id = get_required_str(params, "classRegionId")?;
    items(collect_rows(
        conn,
        "SELECT id, name FROM class_groups WHERE class_region_id = ? ORDER BY name",
        [&class_region_id],
        id_name_str,
    )?)
}

fn lookup_countries(conn: &Connection, _params: &serde_json::Value) -> HandlerResult {
    items(collect_rows(
        conn,
        "SELECT id, name FROM countries ORDER BY name",
        [],
        id_name_int,
    )?)
}

fn lookup_states(conn: &Connection, params: &serde_json::Value) -> HandlerResult {
    let country_id = get_required_i64(params, "countryId")?;
    items(collect_rows(
        conn,
        "SELECT id, name FROM states WHERE country_id = ? ORDER BY name",
        [country_id],
        id_name_int,
    )?)
}

fn lookup_cities(conn: &Connection, params: &serde_json::Value) -> HandlerResult {
    let state_id = get_required_i64(params, "stateId")?;
    items(collect_rows(
        conn,
        "SELECT id, name FROM cities WHERE state_id = ? ORDER BY name",
        [state_id],
        id_name_int,
    )?)
}

fn lookup_options(conn: &Connection, _params: &serde_json::Value) -> HandlerResult {
    let list = |key: &str| {
        db::settings_get_list(conn, key)
            .map_err(|e| HandlerErr::new("db_query_failed", format!("{e:?}")))
    };
    let batches = collect_rows(
        conn,
        &format!(
            "SELECT cb.id, {} AS name FROM class_batches cb
             JOIN class_names cn ON cn.id = cb.class_name_id
             ORDER BY name",
            BATCH_CODE_SQL
        ),
        [],
        id_name_str,
    )?;
    Ok(json!({
        "statuses": list(SETTING_STATUSES)?,
        "natures": list(SETTING_NATURES)?,
        "countries": list(SETTING_COUNTRIES)?,
        "batches": batches,
    }))
}

fn geo_countries_create(
    conn: &Connection,
    _session: &Session,
    params: &serde_json::Value,
) -> HandlerResult {
    let name = get_text(params, "name", 100)?;
    let iso2 = get_optional_text(params, "iso2", 2)?.map(|s| s.to_uppercase());
    let iso3 = get_optional_text(params, "iso3", 3)?.map(|s| s.to_uppercase());
    let phonecode = get_optional_text(params, "phonecode", 255)?;
    conn.execute(
        "INSERT INTO countries(name, iso2, iso3, phonecode) VALUES(?, ?, ?, ?)",
        (&name, &iso2, &iso3, &phonecode),
    )
    .map_err(write_err("db_insert_failed", "countries"))?;
    Ok(json!({ "countryId": conn.last_insert_rowid() }))
}

fn geo_states_create(
    conn: &Connection,
    _session: &Session,
    params: &serde_json::Value,
) -> HandlerResult {
    let country_id = get_required_i64(params, "countryId")?;
    let name = get_text(params, "name", 255)?;
    let iso2 = get_optional_text(params, "iso2", 255)?;
    conn.execute(
        "INSERT INTO states(name, country_id, iso2) VALUES(?, ?, ?)",
        (&name, country_id, &iso2),
    )
    .map_err(write_err("db_insert_failed", "states"))?;
    Ok(json!({ "stateId": conn.last_insert_rowid() }))
}

fn geo_cities_create(
    conn: &Connection,
    _session: &Session,
    params: &serde_json::Value,
) -> HandlerResult {
    let state_id = get_required_i64(params, "stateId")?;
    let name = get_text(params, "name", 255)?;
    let country_id: i64 = conn
        .query_row(
            "SELECT country_id FROM states WHERE id = ?",
            [state_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(query_err)?
        .ok_or_else(|| HandlerErr::not_found("state"))?;
    conn.execute(
        "INSERT INTO cities(name, state_id, country_id) VALUES(?, ?, ?)",
        (&name, state_id, country_id),
    )
    .map_err(write_err("db_insert_failed", "cities"))?;
    Ok(json!({ "cityId": conn.last_insert_rowid() }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let resp = match req.method.as_str() {
        "lookup.batches" => with_conn(state, req, lookup_batches),
        "lookup.regions" => with_conn(state, req, lookup_regions),
        "lookup.groups" => with_conn(state, req, lookup_groups),
        "lookup.countries" => with_conn(state, req, lookup_countries),
        "lookup.states" => with_conn(state, req, lookup_states),
        "lookup.cities" => with_conn(state, req, lookup_cities),
        "lookup.options" => with_conn(state, req, lookup_options),
        "geo.countries.create" => with_user(state, req, geo_countries_create),
        "geo.states.create" => with_user(state, req, geo_states_create),
        "geo.cities.create" => with_user(state, req, geo_cities_create),
        _ => return None,
    };
    Some(resp)
}
