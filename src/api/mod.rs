use rocket::Route;

mod session;
mod vote;

pub fn routes() -> Vec<Route> {
    let mut routes = Vec::new();
    routes.extend(session::routes());
    routes.extend(vote::routes());
    routes
}
