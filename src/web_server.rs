use actix_web::{App, HttpServer, dev::Server, middleware, web};

use crate::config::ServerConfig;
use crate::engine::Engine;
use crate::routes::{ResponseShape, get_languages_handler, json_error_handler, post_run_handler};

pub fn build_server(
    server_config: ServerConfig,
    engine: web::Data<Engine>,
    shape: ResponseShape,
) -> std::io::Result<Server> {
    let shape = web::Data::new(shape);

    let server = HttpServer::new(move || {
        App::new()
            .app_data(engine.clone())
            .app_data(shape.clone())
            .app_data(web::JsonConfig::default().error_handler(json_error_handler))
            .wrap(middleware::Logger::default())
            .service(post_run_handler)
            .service(get_languages_handler)
    })
    .bind((
        server_config
            .bind_address
            .unwrap_or("127.0.0.1".to_string()),
        server_config.bind_port.unwrap_or(12345),
    ))?
    .run();

    Ok(server)
}
