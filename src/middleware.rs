use actix_cors::Cors;

pub fn cors_middleware(frontend_url: Option<&str>) -> Cors {
    match frontend_url {
        Some(origin) => Cors::default()
            .allowed_origin(origin)
            .allow_any_method()
            .allow_any_header()
            .max_age(3600),
        None => Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600),
    }
}
